//! Events emitted to the remote requestor.
//!
//! The requestor treats silence beyond a timeout as a hung guest agent, so
//! every event doubles as a liveness signal; the state machine re-arms its
//! keep-alive timer on each send.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Event names understood by the requestor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A new backup cycle started; the requestor resets its view
    Reset,
    /// Liveness signal while a cycle is active
    KeepAlive,
    /// The cycle finished and all state was released
    RequestorDone,
    /// A step of the cycle failed
    RequestorError,
    /// The cycle is winding down after a requestor abort
    RequestorAbort,
}

impl EventKind {
    /// Wire name of the event
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Reset => "reset",
            EventKind::KeepAlive => "req.keepAlive",
            EventKind::RequestorDone => "req.done",
            EventKind::RequestorError => "req.error",
            EventKind::RequestorAbort => "req.aborted",
        }
    }
}

/// Numeric status codes attached to events
pub mod codes {
    /// Operation succeeded
    pub const SUCCESS: u32 = 0;
    /// A quiesce script failed to launch or exited non-zero
    pub const SCRIPT_ERROR: u32 = 3;
    /// The sync provider failed to start or rejected a notification
    pub const PROVIDER_ERROR: u32 = 4;
    /// The requestor aborted the cycle
    pub const REMOTE_ABORT: u32 = 5;
    /// Failure with no more specific classification
    pub const UNEXPECTED_ERROR: u32 = 6;
}

/// A single event on the requestor channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEvent {
    /// Event name
    pub kind: EventKind,
    /// Numeric status code, see [`codes`]
    pub code: u32,
    /// Free-text message for the requestor's logs
    pub message: String,
}

impl BackupEvent {
    /// Build an event
    pub fn new(kind: EventKind, code: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }
}

/// Errors raised while delivering events
#[derive(Error, Debug)]
pub enum EventError {
    /// The transport side of the channel is gone
    #[error("event channel closed")]
    ChannelClosed,
}

/// Transport-side consumer of backup events.
///
/// Implementations forward events to the remote requestor; the engine never
/// assumes a particular transport.
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event to the requestor
    async fn send_event(&mut self, event: BackupEvent) -> Result<(), EventError>;
}

/// Event sink backed by an unbounded tokio channel
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<BackupEvent>,
}

/// Create a channel-backed sink and the receiver a transport drains
pub fn channel_sink() -> (ChannelEventSink, mpsc::UnboundedReceiver<BackupEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelEventSink { tx }, rx)
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn send_event(&mut self, event: BackupEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::ChannelClosed)
    }
}
