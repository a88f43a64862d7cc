//! Backup state machine.
//!
//! One [`BackupStateMachine`] owns at most one active backup cycle and is
//! the only component the transport layer talks to. A cycle moves through
//! freeze scripts, sync-provider enablement, a wait for the requestor's
//! snapshot signal, and thaw (or freeze-fail) scripts, then finalizes.
//! All progress happens inside [`poll_tick`](BackupStateMachine::poll_tick);
//! external commands only flip flags and cancel work, so a single
//! cooperative task drives everything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::{parse, BackupCommand, CommandReply};
use crate::config::BackupConfig;
use crate::event::{codes, BackupEvent, EventKind, EventSink};
use crate::op::{AsyncOperation, OpStatus};
use crate::provider::{SnapshotRequest, SyncProvider};
use crate::script::{discover, ScriptPhase, ScriptPhaseOp, SharedScriptSet};
use crate::{BackupError, Result};

pub mod driver;
mod keepalive;

pub use driver::CommandRequest;
use keepalive::KeepAlive;

/// Phases of one backup cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CyclePhase {
    /// Freeze scripts are running
    Freezing,
    /// The sync provider is active; waiting on the requestor's signal
    WaitingSnapshot,
    /// Thaw or freeze-fail scripts are running
    Thawing,
}

/// Per-cycle state; exists only while a backup cycle is active
struct BackupState {
    cycle_id: String,
    phase: CyclePhase,
    current_op: Option<Box<dyn AsyncOperation>>,
    op_started_at: Instant,
    poll_period: Duration,
    sync_provider_running: bool,
    sync_provider_failed: bool,
    snapshot_done: bool,
    client_aborted: bool,
    force_requeue: bool,
    generate_manifests: bool,
    volumes: Option<String>,
    scripts: SharedScriptSet,
    teardown_started: bool,
}

/// Outcome of polling the current operation during one tick
enum OpOutcome {
    /// No operation installed
    Idle,
    /// Operation still running; the tick ends here
    Pending,
    /// Operation finished and was released
    Finished,
    /// Operation failed or was canceled; released
    Failed {
        name: String,
        status: OpStatus,
        code: u32,
    },
}

/// The backup protocol state machine
pub struct BackupStateMachine {
    config: BackupConfig,
    provider: Box<dyn SyncProvider>,
    sink: Box<dyn EventSink>,
    keep_alive: KeepAlive,
    state: Option<BackupState>,
}

impl BackupStateMachine {
    /// Create a machine with the given provider and event sink
    pub fn new(
        config: BackupConfig,
        provider: Box<dyn SyncProvider>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let keep_alive = KeepAlive::new(config.keep_alive_period);
        Self {
            config,
            provider,
            sink,
            keep_alive,
            state: None,
        }
    }

    /// Whether a backup cycle is currently active
    pub fn in_progress(&self) -> bool {
        self.state.is_some()
    }

    /// Delay until the next poll tick; `None` while idle, zero when an
    /// external command asked for an immediate requeue
    pub fn next_poll_in(&self) -> Option<Duration> {
        self.state.as_ref().map(|state| {
            if state.force_requeue {
                Duration::ZERO
            } else {
                state.poll_period
            }
        })
    }

    /// Parse and handle one wire command, producing the wire reply
    pub async fn dispatch(&mut self, line: &str) -> CommandReply {
        match parse(line) {
            Ok(command) => self.handle_command(command).await,
            Err(err) => CommandReply::fail(err.to_string()),
        }
    }

    /// Handle one parsed command, producing the wire reply
    pub async fn handle_command(&mut self, command: BackupCommand) -> CommandReply {
        let result = match command {
            BackupCommand::Start {
                generate_manifests,
                volumes,
            } => self.start(generate_manifests, volumes).await,
            BackupCommand::Abort => self.abort().await,
            BackupCommand::SnapshotDone => self.snapshot_done().await,
        };
        match result {
            Ok(()) => CommandReply::ok(),
            Err(err) => CommandReply::fail(err.to_string()),
        }
    }

    /// Begin a backup cycle: reset the requestor's view, discover the
    /// quiesce scripts, and launch the freeze phase.
    pub async fn start(
        &mut self,
        generate_manifests: bool,
        volumes: Option<String>,
    ) -> Result<()> {
        if self.state.is_some() {
            return Err(BackupError::OperationAlreadyInProgress);
        }

        let cycle_id = format!("backup-{}", Uuid::new_v4());
        info!(
            cycle_id = %cycle_id,
            generate_manifests,
            volumes = volumes.as_deref().unwrap_or(""),
            "starting quiesced backup cycle"
        );

        self.keep_alive.rearm();
        self.send_event(EventKind::Reset, codes::SUCCESS, "").await?;

        let scripts: SharedScriptSet = Arc::new(Mutex::new(discover(
            &self.config.script_dir(),
            self.config.legacy_scripts.as_ref(),
        )));
        let op = ScriptPhaseOp::start(
            ScriptPhase::Freeze,
            Arc::clone(&scripts),
            self.config.script_arg.clone(),
        );

        self.state = Some(BackupState {
            cycle_id,
            phase: CyclePhase::Freezing,
            current_op: Some(Box::new(op)),
            op_started_at: Instant::now(),
            poll_period: self.config.poll_period_active,
            sync_provider_running: false,
            sync_provider_failed: false,
            snapshot_done: false,
            client_aborted: false,
            force_requeue: false,
            generate_manifests,
            volumes,
            scripts,
            teardown_started: false,
        });
        Ok(())
    }

    /// Abort the active cycle.
    ///
    /// Cancels the current operation and tells the provider to abort;
    /// the next poll tick drives the freeze-fail cleanup and finalize.
    pub async fn abort(&mut self) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or(BackupError::NoBackupInProgress)?;
        warn!(cycle_id = %state.cycle_id, "backup aborted by requestor");

        state.client_aborted = true;
        state.force_requeue = true;
        if let Some(mut op) = state.current_op.take() {
            op.cancel().await;
            if op.query_status().await == OpStatus::Pending {
                // Still draining; the next poll tick reaps it.
                state.current_op = Some(op);
            }
        }
        let provider_running = state.sync_provider_running;

        if provider_running {
            self.provider.abort().await;
        }
        self.send_event(
            EventKind::RequestorAbort,
            codes::REMOTE_ABORT,
            "backup aborted by requestor",
        )
        .await?;
        Ok(())
    }

    /// The requestor finished taking the snapshot.
    ///
    /// Forwarded to the provider; neither path advances the cycle here.
    /// The next poll tick does.
    pub async fn snapshot_done(&mut self) -> Result<()> {
        if self.state.is_none() {
            return Err(BackupError::NoBackupInProgress);
        }

        let failure = match self.provider.snapshot_done().await {
            Ok(()) => None,
            Err(err) => Some(err.to_string()),
        };

        if let Some(state) = self.state.as_mut() {
            state.force_requeue = true;
            if failure.is_none() {
                state.snapshot_done = true;
                info!(cycle_id = %state.cycle_id, "requestor reports snapshot complete");
            } else {
                state.sync_provider_failed = true;
            }
        }

        if let Some(message) = failure {
            error!(error = %message, "sync provider rejected snapshot completion");
            self.send_event(EventKind::RequestorError, codes::PROVIDER_ERROR, message)
                .await?;
        }
        Ok(())
    }

    /// Run one step of the protocol.
    ///
    /// Polls the current operation if there is one, then advances the
    /// cycle as far as it can go without waiting: enabling the provider,
    /// starting the thaw or freeze-fail phase, or finalizing.
    pub async fn poll_tick(&mut self) -> Result<()> {
        let outcome = match self.state.as_mut() {
            None => return Ok(()),
            Some(state) => {
                state.force_requeue = false;
                match state.current_op.take() {
                    None => OpOutcome::Idle,
                    Some(mut op) => {
                        if let Some(deadline) = self.config.operation_deadline {
                            if state.op_started_at.elapsed() >= deadline {
                                warn!(
                                    cycle_id = %state.cycle_id,
                                    op = op.name(),
                                    "operation exceeded deadline, canceling"
                                );
                                op.cancel().await;
                            }
                        }
                        match op.query_status().await {
                            OpStatus::Pending => {
                                state.current_op = Some(op);
                                OpOutcome::Pending
                            }
                            OpStatus::Finished => {
                                info!(
                                    cycle_id = %state.cycle_id,
                                    op = op.name(),
                                    "operation finished"
                                );
                                OpOutcome::Finished
                            }
                            status => {
                                warn!(
                                    cycle_id = %state.cycle_id,
                                    op = op.name(),
                                    ?status,
                                    "operation failed"
                                );
                                let code = match state.phase {
                                    CyclePhase::WaitingSnapshot => codes::PROVIDER_ERROR,
                                    _ => codes::SCRIPT_ERROR,
                                };
                                OpOutcome::Failed {
                                    name: op.name().to_string(),
                                    status,
                                    code,
                                }
                            }
                        }
                        // op dropped here on the terminal paths, which
                        // releases its resources
                    }
                }
            }
        };

        match outcome {
            OpOutcome::Pending => return Ok(()),
            OpOutcome::Failed { name, status, code } => {
                let message = match status {
                    OpStatus::Canceled => format!("{name} canceled"),
                    _ => format!("{name} failed"),
                };
                self.send_event(EventKind::RequestorError, code, message)
                    .await?;

                if let Some(state) = self.state.as_mut() {
                    if state.sync_provider_running {
                        state.sync_provider_failed = true;
                    } else if !state.teardown_started {
                        // Freeze-time failure: run the cleanup phase
                        // before the cycle goes away.
                        self.begin_teardown(ScriptPhase::FreezeFail);
                        return Ok(());
                    }
                    // A teardown-phase failure falls through to finalize.
                }
            }
            OpOutcome::Idle | OpOutcome::Finished => {}
        }

        self.advance().await
    }

    /// Advance the cycle now that no operation is pending
    async fn advance(&mut self) -> Result<()> {
        let phase = match self.state.as_ref() {
            None => return Ok(()),
            Some(state) if state.current_op.is_some() => return Ok(()),
            Some(state) => state.phase,
        };

        match phase {
            CyclePhase::Freezing => {
                let aborted = self
                    .state
                    .as_ref()
                    .map(|s| s.client_aborted)
                    .unwrap_or(false);
                if aborted {
                    self.begin_teardown(ScriptPhase::FreezeFail);
                    Ok(())
                } else {
                    self.enable_sync_provider().await
                }
            }
            CyclePhase::WaitingSnapshot => {
                let ready = self
                    .state
                    .as_ref()
                    .map(|s| s.snapshot_done || s.sync_provider_failed || s.client_aborted)
                    .unwrap_or(false);
                if !ready {
                    return Ok(());
                }
                let clean = self
                    .state
                    .as_mut()
                    .map(|s| {
                        s.sync_provider_running = false;
                        s.snapshot_done && !s.sync_provider_failed && !s.client_aborted
                    })
                    .unwrap_or(false);
                let teardown = if clean {
                    ScriptPhase::Thaw
                } else {
                    ScriptPhase::FreezeFail
                };
                self.begin_teardown(teardown);
                Ok(())
            }
            CyclePhase::Thawing => self.finalize().await,
        }
    }

    /// Invoke the provider once the freeze scripts are done
    async fn enable_sync_provider(&mut self) -> Result<()> {
        let request = match self.state.as_ref() {
            None => return Ok(()),
            Some(state) => SnapshotRequest {
                generate_manifests: state.generate_manifests,
                volumes: state.volumes.clone(),
            },
        };

        match self.provider.start(&request).await {
            Ok(provider_op) => {
                if let Some(state) = self.state.as_mut() {
                    state.sync_provider_running = true;
                    state.phase = CyclePhase::WaitingSnapshot;
                    state.poll_period = self.config.poll_period_idle;
                    if let Some(op) = provider_op {
                        debug!(op = op.name(), "provider installed its own operation");
                        state.current_op = Some(op);
                        state.op_started_at = Instant::now();
                        state.poll_period = self.config.poll_period_active;
                    }
                    info!(
                        cycle_id = %state.cycle_id,
                        "sync provider enabled, waiting for snapshot"
                    );
                }
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "failed to enable sync provider");
                self.send_event(
                    EventKind::RequestorError,
                    codes::PROVIDER_ERROR,
                    format!("failed to enable sync provider: {err}"),
                )
                .await?;
                self.begin_teardown(ScriptPhase::FreezeFail);
                Ok(())
            }
        }
    }

    /// Start the thaw or freeze-fail phase over the cycle's script list.
    ///
    /// The script list was built during freeze and must get its paired
    /// teardown walk on every path, so the guest never stays frozen.
    fn begin_teardown(&mut self, phase: ScriptPhase) {
        if let Some(state) = self.state.as_mut() {
            info!(
                cycle_id = %state.cycle_id,
                phase = phase.token(),
                "starting cleanup script phase"
            );
            state.teardown_started = true;
            state.phase = CyclePhase::Thawing;
            state.poll_period = self.config.poll_period_active;
            let op = ScriptPhaseOp::start(
                phase,
                Arc::clone(&state.scripts),
                self.config.script_arg.clone(),
            );
            state.current_op = Some(Box::new(op));
            state.op_started_at = Instant::now();
        }
    }

    /// Tear the cycle down and tell the requestor it is over
    async fn finalize(&mut self) -> Result<()> {
        if let Some(mut state) = self.state.take() {
            if let Some(mut op) = state.current_op.take() {
                op.cancel().await;
            }
            info!(cycle_id = %state.cycle_id, "backup cycle complete");
            // Dropping the state releases the script list; any child
            // still attached dies with it (kill-on-drop).
            drop(state);
            self.send_event(EventKind::RequestorDone, codes::SUCCESS, "")
                .await?;
        }
        Ok(())
    }

    /// Emit a keep-alive if the re-arm interval expired with no event
    /// sent in between. Only meaningful while a cycle is active.
    pub async fn keep_alive_tick(&mut self) -> Result<()> {
        if self.state.is_some() && self.keep_alive.due() {
            debug!("keep-alive due, signaling liveness");
            self.send_event(EventKind::KeepAlive, codes::SUCCESS, "")
                .await?;
        }
        Ok(())
    }

    /// Send one event and re-arm the keep-alive timer
    async fn send_event(
        &mut self,
        kind: EventKind,
        code: u32,
        message: impl Into<String>,
    ) -> Result<()> {
        let event = BackupEvent::new(kind, code, message);
        debug!(event = event.kind.name(), code = event.code, "sending requestor event");
        self.sink.send_event(event).await?;
        self.keep_alive.rearm();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel_sink;
    use crate::provider::NullSyncProvider;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn machine_with_dir(
        dir: &std::path::Path,
    ) -> (BackupStateMachine, mpsc::UnboundedReceiver<BackupEvent>) {
        let config = BackupConfig::new(dir)
            .with_poll_period_active(Duration::from_millis(5))
            .with_poll_period_idle(Duration::from_millis(5));
        let (sink, events) = channel_sink();
        let machine =
            BackupStateMachine::new(config, Box::new(NullSyncProvider), Box::new(sink));
        (machine, events)
    }

    fn drain_kinds(events: &mut mpsc::UnboundedReceiver<BackupEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut machine, mut events) = machine_with_dir(dir.path());

        machine.start(false, None).await.unwrap();
        let err = machine.start(false, None).await.unwrap_err();
        assert!(matches!(err, BackupError::OperationAlreadyInProgress));

        // Only the first start reset the requestor's view.
        assert_eq!(drain_kinds(&mut events), vec![EventKind::Reset]);
    }

    #[tokio::test]
    async fn test_commands_require_active_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut machine, _events) = machine_with_dir(dir.path());

        let reply = machine.dispatch("abort").await;
        assert!(!reply.success);
        assert_eq!(reply.message, "no backup in progress");

        let reply = machine.dispatch("snapshotDone").await;
        assert!(!reply.success);
        assert_eq!(reply.message, "no backup in progress");
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut machine, _events) = machine_with_dir(dir.path());

        let reply = machine.dispatch("resume now").await;
        assert!(!reply.success);
        assert_eq!(reply.message, "unknown command: resume");
    }

    #[tokio::test]
    async fn test_cycle_without_scripts_completes() {
        let dir = tempfile::tempdir().unwrap();
        // No backupScripts.d under the install path: freeze is a no-op.
        let (mut machine, mut events) = machine_with_dir(dir.path());

        assert!(machine.dispatch("start").await.success);
        assert!(machine.in_progress());

        // Freeze finishes, the provider comes up, and the cycle waits.
        for _ in 0..4 {
            machine.poll_tick().await.unwrap();
        }
        assert!(machine.in_progress());

        assert!(machine.dispatch("snapshotDone").await.success);
        while machine.in_progress() {
            machine.poll_tick().await.unwrap();
        }

        assert_eq!(
            drain_kinds(&mut events),
            vec![EventKind::Reset, EventKind::RequestorDone]
        );
    }

    #[tokio::test]
    async fn test_abort_while_waiting_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut machine, mut events) = machine_with_dir(dir.path());

        machine.start(false, None).await.unwrap();
        // Drive into the waiting phase.
        for _ in 0..4 {
            machine.poll_tick().await.unwrap();
        }

        machine.abort().await.unwrap();
        assert_eq!(machine.next_poll_in(), Some(Duration::ZERO));

        while machine.in_progress() {
            machine.poll_tick().await.unwrap();
        }

        assert_eq!(
            drain_kinds(&mut events),
            vec![
                EventKind::Reset,
                EventKind::RequestorAbort,
                EventKind::RequestorDone,
            ]
        );
    }

    #[tokio::test]
    async fn test_keep_alive_only_when_active() {
        let dir = tempfile::tempdir().unwrap();
        let (mut machine, mut events) = machine_with_dir(dir.path());
        machine.keep_alive = KeepAlive::new(Duration::from_millis(20));

        // Idle: no keep-alives even when the timer is due.
        tokio::time::sleep(Duration::from_millis(5)).await;
        machine.keep_alive_tick().await.unwrap();
        assert!(drain_kinds(&mut events).is_empty());

        machine.start(false, None).await.unwrap();
        drain_kinds(&mut events);

        tokio::time::sleep(Duration::from_millis(5)).await;
        machine.keep_alive_tick().await.unwrap();
        assert_eq!(drain_kinds(&mut events), vec![EventKind::KeepAlive]);
    }
}
