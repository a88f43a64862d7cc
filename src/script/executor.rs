//! Script phase execution.
//!
//! A [`ScriptPhaseOp`] runs one phase (freeze, thaw, or freeze-fail)
//! over the cycle's shared script list, one child process at a time.
//!
//! Freeze is strict: the first launch failure or non-zero exit ends the
//! phase with an error, because a failed quiesce step invalidates the
//! snapshot. Thaw and freeze-fail are resilient: failures are recorded
//! but the walk continues, since skipping a thaw step can leave the guest
//! filesystem permanently frozen.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::op::{AsyncOperation, OpStatus};
use crate::script::discovery::{ScriptSet, SharedScriptSet};
use crate::script::ScriptError;

/// The three script execution modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    /// Quiesce applications ahead of the snapshot
    Freeze,
    /// Undo freeze-time work after a failed or aborted cycle
    FreezeFail,
    /// Undo freeze-time work after a successful snapshot
    Thaw,
}

impl ScriptPhase {
    /// Token passed to scripts as their first argument
    pub fn token(self) -> &'static str {
        match self {
            ScriptPhase::Freeze => "freeze",
            ScriptPhase::FreezeFail => "freezeFail",
            ScriptPhase::Thaw => "thaw",
        }
    }

    /// Freeze walks the list forward; cleanup phases walk it backward
    fn forward(self) -> bool {
        matches!(self, ScriptPhase::Freeze)
    }

    /// Whether a failure ends the phase immediately
    fn strict(self) -> bool {
        matches!(self, ScriptPhase::Freeze)
    }
}

/// Asynchronous operation running one script phase.
///
/// The freeze phase starts with the cursor before the first entry; thaw
/// and freeze-fail resume from wherever the previous phase left the
/// cursor, so after a freeze failure at index `k` the cleanup walk starts
/// at `k - 1` and never touches scripts that were never launched.
pub struct ScriptPhaseOp {
    phase: ScriptPhase,
    scripts: SharedScriptSet,
    script_arg: Option<String>,
    canceled: bool,
    failed: bool,
    label: &'static str,
}

impl ScriptPhaseOp {
    /// Create the phase operation and launch its first script.
    ///
    /// If the set is empty (or, for cleanup phases, every script fails to
    /// launch) the operation reports a terminal status on the first poll.
    pub fn start(
        phase: ScriptPhase,
        scripts: SharedScriptSet,
        script_arg: Option<String>,
    ) -> Self {
        let mut op = Self {
            phase,
            scripts: Arc::clone(&scripts),
            script_arg,
            canceled: false,
            failed: false,
            label: match phase {
                ScriptPhase::Freeze => "freeze scripts",
                ScriptPhase::FreezeFail => "freeze-fail scripts",
                ScriptPhase::Thaw => "thaw scripts",
            },
        };
        let mut set = scripts.lock();
        op.run_next(&mut set);
        op
    }

    /// Advance the cursor and launch the next script.
    ///
    /// Returns `Pending` once a script is running, a terminal status once
    /// the walk is done. Launch failures follow the phase policy: strict
    /// phases stop, cleanup phases record the failure and keep walking.
    fn run_next(&mut self, set: &mut ScriptSet) -> OpStatus {
        loop {
            let len = set.len() as isize;
            let next = if self.phase.forward() {
                set.cursor() + 1
            } else {
                set.cursor() - 1
            };
            if next < 0 || next >= len {
                set.set_cursor(next.clamp(-1, len));
                return self.terminal_status(set);
            }
            set.set_cursor(next);

            let idx = next as usize;
            let path = set.path_at(idx, self.phase);
            match spawn_script(&path, self.phase, self.script_arg.as_deref()) {
                Ok(child) => {
                    info!(
                        script = %path.display(),
                        phase = self.phase.token(),
                        "launched quiesce script"
                    );
                    set.attach_child(idx, child);
                    return OpStatus::Pending;
                }
                Err(err) => {
                    warn!(error = %err, phase = self.phase.token(), "script launch failed");
                    if self.phase.strict() {
                        self.failed = true;
                        return OpStatus::Error;
                    }
                    set.mark_thaw_failed();
                    // Keep walking so every remaining script still runs.
                }
            }
        }
    }

    /// Status once the walk is over: cleanup phases surface recorded
    /// failures, a completed freeze walk is always a success.
    fn terminal_status(&self, set: &ScriptSet) -> OpStatus {
        if !self.phase.strict() && set.thaw_failed() {
            OpStatus::Error
        } else {
            OpStatus::Finished
        }
    }
}

#[async_trait]
impl AsyncOperation for ScriptPhaseOp {
    async fn query_status(&mut self) -> OpStatus {
        if self.canceled {
            return OpStatus::Canceled;
        }
        if self.failed {
            return OpStatus::Error;
        }

        let scripts = Arc::clone(&self.scripts);
        let mut set = scripts.lock();
        let idx = match set.cursor_index() {
            Some(idx) => idx,
            None => return self.terminal_status(&set),
        };
        let path = set.path_at(idx, self.phase);

        match set.poll_child(idx) {
            // No handle at the cursor: a previous phase already reaped it.
            None => self.terminal_status(&set),
            Some(Ok(None)) => OpStatus::Pending,
            Some(Ok(Some(status))) => {
                if status.success() {
                    debug!(script = %path.display(), "quiesce script finished");
                    self.run_next(&mut set)
                } else {
                    let err = ScriptError::Exit { path, status };
                    warn!(error = %err, phase = self.phase.token(), "quiesce script failed");
                    if self.phase.strict() {
                        self.failed = true;
                        OpStatus::Error
                    } else {
                        set.mark_thaw_failed();
                        self.run_next(&mut set)
                    }
                }
            }
            Some(Err(source)) => {
                let err = ScriptError::Wait { path, source };
                warn!(error = %err, phase = self.phase.token(), "lost track of quiesce script");
                if self.phase.strict() {
                    self.failed = true;
                    OpStatus::Error
                } else {
                    set.mark_thaw_failed();
                    self.run_next(&mut set)
                }
            }
        }
    }

    async fn cancel(&mut self) {
        let scripts = Arc::clone(&self.scripts);
        let mut set = scripts.lock();
        if let Some(idx) = set.cursor_index() {
            // Best effort; completed scripts are not unwound.
            if let Err(err) = set.kill_child_at(idx) {
                warn!(error = %err, "failed to kill quiesce script");
            }
        }
        self.canceled = true;
    }

    fn name(&self) -> &str {
        self.label
    }
}

fn spawn_script(
    path: &Path,
    phase: ScriptPhase,
    script_arg: Option<&str>,
) -> Result<Child, ScriptError> {
    let mut command = Command::new(path);
    command.arg(phase.token());
    if let Some(arg) = script_arg {
        command.arg(arg);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    command.spawn().map_err(|source| ScriptError::Launch {
        path: path.to_path_buf(),
        source,
    })
}
