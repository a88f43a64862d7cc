//! Asynchronous operation abstraction.
//!
//! Every long-running backup step (a script phase, a provider-owned
//! snapshot operation) conforms to the same minimal contract so the state
//! machine can sequence them uniformly.

use async_trait::async_trait;

/// Status reported by [`AsyncOperation::query_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation is still making progress
    Pending,
    /// The operation completed successfully
    Finished,
    /// The operation was canceled before completing
    Canceled,
    /// The operation failed
    Error,
}

impl OpStatus {
    /// Whether the status is terminal (anything but `Pending`)
    pub fn is_terminal(self) -> bool {
        !matches!(self, OpStatus::Pending)
    }
}

/// Contract implemented by every long-running backup step.
///
/// `query_status` must never block; it may advance internal progress as a
/// side effect (for example launching the next script of a phase once the
/// previous one exits). `cancel` is best-effort: callers keep polling
/// `query_status` until it reports a terminal status before dropping the
/// operation. Dropping releases all resources the operation still holds.
#[async_trait]
pub trait AsyncOperation: Send {
    /// Poll the operation, advancing it if possible
    async fn query_status(&mut self) -> OpStatus;

    /// Request cancellation; the operation winds down on subsequent polls
    async fn cancel(&mut self);

    /// Diagnostic label used in log output
    fn name(&self) -> &str;
}
