//! Backup engine configuration.
//!
//! Resolves the install path (explicitly or from the environment), the
//! quiesce-script directory underneath it, and the timing knobs the state
//! machine runs on.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted by [`BackupConfig::from_env`].
pub const INSTALL_PATH_ENV: &str = "VMBACKUP_INSTALL_PATH";

/// Directory under the install path holding user quiesce scripts.
pub const SCRIPT_DIR_NAME: &str = "backupScripts.d";

/// Default poll period while a script phase or teardown is active.
pub const DEFAULT_POLL_PERIOD_ACTIVE: Duration = Duration::from_millis(100);

/// Default poll period while waiting on the requestor's snapshot signal.
pub const DEFAULT_POLL_PERIOD_IDLE: Duration = Duration::from_secs(1);

/// Default keep-alive period. The keep-alive timer re-arms at 1/20 of this.
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(300);

/// Errors raised while resolving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No install path given and the environment does not provide one
    #[error("install path unavailable: set {INSTALL_PATH_ENV} or pass an explicit path")]
    InstallPathUnavailable,
}

/// Legacy pre-freeze/post-thaw script pair.
///
/// Older deployments ship a hardcoded script pair instead of dropping files
/// into the script directory. When configured, the pair becomes the first
/// discovered entry: its freeze script runs before every directory script
/// and its thaw script runs after all of them (phases walk the list in
/// reverse).
#[derive(Debug, Clone)]
pub struct LegacyScripts {
    /// Script invoked during the freeze and freeze-fail phases
    pub freeze: PathBuf,
    /// Script invoked during the thaw phase
    pub thaw: PathBuf,
}

/// Configuration for the backup state machine
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Guest tools install path; the script directory lives underneath it
    pub install_path: PathBuf,
    /// Optional extra argument appended to every script invocation
    pub script_arg: Option<String>,
    /// Optional legacy script pair, prepended to discovery when present
    pub legacy_scripts: Option<LegacyScripts>,
    /// Poll period while an operation is actively progressing
    pub poll_period_active: Duration,
    /// Poll period while waiting for the snapshot-done signal
    pub poll_period_idle: Duration,
    /// Keep-alive period; the re-arm interval is 1/20 of this
    pub keep_alive_period: Duration,
    /// Optional upper bound on how long a single operation may stay
    /// pending before it is canceled. `None` preserves the historical
    /// behavior of polling forever.
    pub operation_deadline: Option<Duration>,
}

impl BackupConfig {
    /// Create a configuration rooted at the given install path
    pub fn new(install_path: impl Into<PathBuf>) -> Self {
        Self {
            install_path: install_path.into(),
            script_arg: None,
            legacy_scripts: None,
            poll_period_active: DEFAULT_POLL_PERIOD_ACTIVE,
            poll_period_idle: DEFAULT_POLL_PERIOD_IDLE,
            keep_alive_period: DEFAULT_KEEP_ALIVE_PERIOD,
            operation_deadline: None,
        }
    }

    /// Resolve the install path from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var_os(INSTALL_PATH_ENV) {
            Some(path) if !path.is_empty() => Ok(Self::new(PathBuf::from(path))),
            _ => Err(ConfigError::InstallPathUnavailable),
        }
    }

    /// Set the extra argument passed to every script invocation
    pub fn with_script_arg(mut self, arg: impl Into<String>) -> Self {
        self.script_arg = Some(arg.into());
        self
    }

    /// Enable the legacy pre-freeze/post-thaw script pair
    pub fn with_legacy_scripts(mut self, scripts: LegacyScripts) -> Self {
        self.legacy_scripts = Some(scripts);
        self
    }

    /// Override the active-phase poll period
    pub fn with_poll_period_active(mut self, period: Duration) -> Self {
        self.poll_period_active = period;
        self
    }

    /// Override the waiting-phase poll period
    pub fn with_poll_period_idle(mut self, period: Duration) -> Self {
        self.poll_period_idle = period;
        self
    }

    /// Override the keep-alive period
    pub fn with_keep_alive_period(mut self, period: Duration) -> Self {
        self.keep_alive_period = period;
        self
    }

    /// Cancel any operation that stays pending longer than `deadline`
    pub fn with_operation_deadline(mut self, deadline: Duration) -> Self {
        self.operation_deadline = Some(deadline);
        self
    }

    /// Directory scanned for quiesce scripts
    pub fn script_dir(&self) -> PathBuf {
        self.install_path.join(SCRIPT_DIR_NAME)
    }

    /// Install path accessor
    pub fn install_path(&self) -> &Path {
        &self.install_path
    }
}
