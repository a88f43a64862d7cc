//! Wire command parsing.
//!
//! The requestor drives the engine with three commands carried as
//! space-delimited tokens in a single string:
//!
//! ```text
//! start [<generateManifests:int>] [<volumes>]
//! abort
//! snapshotDone
//! ```
//!
//! Replies travel back as a `(message, success)` pair; [`CommandReply`]
//! models that shape so a transport can be a thin adapter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing a command string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command string held no tokens
    #[error("empty command")]
    Empty,

    /// The first token named no known command
    #[error("unknown command: {0}")]
    Unknown(String),

    /// An argument did not parse
    #[error("invalid argument for {command}: {argument}")]
    InvalidArgument {
        /// Command the argument belonged to
        command: &'static str,
        /// The offending token
        argument: String,
    },
}

/// A parsed requestor command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupCommand {
    /// Begin a backup cycle
    Start {
        /// Whether the provider should generate backup manifests
        generate_manifests: bool,
        /// Optional volume list forwarded to the provider
        volumes: Option<String>,
    },
    /// Abort the active cycle
    Abort,
    /// The requestor finished taking the snapshot
    SnapshotDone,
}

/// Parse a space-delimited command string
pub fn parse(line: &str) -> Result<BackupCommand, CommandError> {
    let mut tokens = line.split_whitespace();
    let command = tokens.next().ok_or(CommandError::Empty)?;

    match command {
        "start" => {
            let generate_manifests = match tokens.next() {
                Some(token) => {
                    let value: i64 =
                        token
                            .parse()
                            .map_err(|_| CommandError::InvalidArgument {
                                command: "start",
                                argument: token.to_string(),
                            })?;
                    value != 0
                }
                None => false,
            };
            let rest: Vec<&str> = tokens.collect();
            let volumes = if rest.is_empty() {
                None
            } else {
                Some(rest.join(" "))
            };
            Ok(BackupCommand::Start {
                generate_manifests,
                volumes,
            })
        }
        "abort" => Ok(BackupCommand::Abort),
        "snapshotDone" => Ok(BackupCommand::SnapshotDone),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Reply returned to the requestor for every command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    /// Error message, empty on success
    pub message: String,
    /// Whether the command was accepted
    pub success: bool,
}

impl CommandReply {
    /// Successful reply with an empty message
    pub fn ok() -> Self {
        Self {
            message: String::new(),
            success: true,
        }
    }

    /// Failed reply carrying an error message
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: false,
        }
    }
}
