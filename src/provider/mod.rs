//! Pluggable sync-provider contract.
//!
//! The sync provider is the OS-level quiescing backend: a kernel sync
//! driver, a VSS-style snapshot subsystem, or nothing at all. The state
//! machine only ever drives it through this trait; concrete backends live
//! with the platform integration, outside this crate.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::op::AsyncOperation;

/// Errors reported by sync-provider backends
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The backend could not begin quiescing
    #[error("sync provider failed to start: {0}")]
    Start(String),

    /// The backend rejected the snapshot-done notification
    #[error("sync provider rejected snapshot completion: {0}")]
    Notify(String),
}

/// Parameters carried from the start command to the provider
#[derive(Debug, Clone, Default)]
pub struct SnapshotRequest {
    /// Whether the backend should generate backup manifests
    pub generate_manifests: bool,
    /// Optional volume list the requestor wants quiesced
    pub volumes: Option<String>,
}

/// Contract for the pluggable quiescing backend.
///
/// `start` is invoked exactly once per backup cycle, after the freeze
/// scripts finish. The backend does not expose a polling contract for
/// snapshot readiness; the requestor signals it out of band and the state
/// machine forwards it via `snapshot_done`. A backend may hand back an
/// [`AsyncOperation`] from `start`; the state machine then owns and polls
/// it like any other operation, and its failure fails the cycle.
/// Dropping the provider releases whatever it still holds.
#[async_trait]
pub trait SyncProvider: Send {
    /// Begin quiescing; called once the freeze scripts have finished
    async fn start(
        &mut self,
        request: &SnapshotRequest,
    ) -> Result<Option<Box<dyn AsyncOperation>>, ProviderError>;

    /// Abandon quiescing; called on requestor abort or cycle failure
    async fn abort(&mut self);

    /// The requestor finished taking the snapshot
    async fn snapshot_done(&mut self) -> Result<(), ProviderError>;
}

/// Fallback provider used when no OS-level quiescing backend is available.
///
/// Freeze scripts still run, so application-level consistency is
/// preserved; the filesystem itself is snapshotted without kernel
/// assistance.
pub struct NullSyncProvider;

#[async_trait]
impl SyncProvider for NullSyncProvider {
    async fn start(
        &mut self,
        request: &SnapshotRequest,
    ) -> Result<Option<Box<dyn AsyncOperation>>, ProviderError> {
        debug!(
            generate_manifests = request.generate_manifests,
            volumes = request.volumes.as_deref().unwrap_or(""),
            "null sync provider active, no OS-level quiescing"
        );
        Ok(None)
    }

    async fn abort(&mut self) {}

    async fn snapshot_done(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }
}
