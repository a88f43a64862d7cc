//! Quiesce-script discovery and phase execution.
//!
//! User-supplied scripts live directly under the configured script
//! directory. One ordered list is built per backup cycle; the freeze phase
//! walks it forward, and the thaw and freeze-fail phases walk it in
//! reverse so every script gets a chance to undo its freeze-time work.

use std::path::PathBuf;
use thiserror::Error;

pub mod discovery;
pub mod executor;

pub use discovery::{discover, ScriptEntry, ScriptSet, ScriptSource, SharedScriptSet};
pub use executor::{ScriptPhase, ScriptPhaseOp};

/// Errors raised by the script subsystem
#[derive(Error, Debug)]
pub enum ScriptError {
    /// A script could not be spawned
    #[error("failed to launch script {path}: {source}")]
    Launch {
        /// Script that failed to launch
        path: PathBuf,
        /// Underlying spawn error
        source: std::io::Error,
    },

    /// A script exited with a non-zero status
    #[error("script {path} exited with {status}")]
    Exit {
        /// Script that failed
        path: PathBuf,
        /// The exit status it reported
        status: std::process::ExitStatus,
    },

    /// Waiting on a script's process handle failed
    #[error("failed to poll script {path}: {source}")]
    Wait {
        /// Script whose handle could not be polled
        path: PathBuf,
        /// Underlying wait error
        source: std::io::Error,
    },
}
