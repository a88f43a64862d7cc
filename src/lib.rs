//! # VmBackup
//!
//! Guest-side orchestration engine for quiesced virtual machine backups.
//!
//! ## Overview
//!
//! A hypervisor-side requestor asks the guest to make its filesystems
//! application-consistent, take a snapshot, and undo the quiescing again.
//! This crate implements the guest half of that protocol: a single-flight
//! backup state machine that sequences pre-freeze scripts, a pluggable
//! filesystem sync provider, and post-thaw scripts, while staying
//! responsive to cancellation and keeping the requestor alive with
//! periodic keep-alive events.
//!
//! ## Quick Start
//!
//! ```rust
//! use vmbackup::config::BackupConfig;
//! use vmbackup::event::channel_sink;
//! use vmbackup::machine::BackupStateMachine;
//! use vmbackup::provider::NullSyncProvider;
//!
//! # async fn example() -> vmbackup::Result<()> {
//! let config = BackupConfig::new("/etc/vmbackup");
//! let (sink, _events) = channel_sink();
//! let mut machine = BackupStateMachine::new(
//!     config,
//!     Box::new(NullSyncProvider),
//!     Box::new(sink),
//! );
//!
//! // Transport adapter: forward requestor commands, poll until idle.
//! let reply = machine.dispatch("start 1").await;
//! assert!(reply.success);
//! while machine.in_progress() {
//!     machine.poll_tick().await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`machine`]: the backup state machine driving the protocol
//! - [`script`]: quiesce-script discovery and phase execution
//! - [`provider`]: the pluggable sync-provider contract
//! - [`op`]: the asynchronous operation abstraction
//! - [`event`]: events emitted to the remote requestor
//! - [`command`]: wire command parsing
//! - [`config`]: engine configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for backup engine operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for backup engine operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Configuration resolution error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Script discovery or execution error
    #[error("Script error: {0}")]
    Script(#[from] script::ScriptError),

    /// Sync provider error
    #[error("Sync provider error: {0}")]
    Provider(#[from] provider::ProviderError),

    /// Wire command parsing error
    #[error("Command error: {0}")]
    Command(#[from] command::CommandError),

    /// Event delivery error
    #[error("Event error: {0}")]
    Event(#[from] event::EventError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A second start while a backup cycle is active
    #[error("backup operation already in progress")]
    OperationAlreadyInProgress,

    /// Abort or snapshotDone with no active cycle
    #[error("no backup in progress")]
    NoBackupInProgress,
}

/// Engine configuration module
pub mod config;

/// Asynchronous operation abstraction
pub mod op;

/// Quiesce-script discovery and execution
pub mod script;

/// Pluggable sync-provider contract
pub mod provider;

/// Events emitted to the remote requestor
pub mod event;

/// Wire command parsing
pub mod command;

/// Backup state machine
pub mod machine;
