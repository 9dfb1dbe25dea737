//! Pool configuration.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::platform::PlatformKey;

/// Environment variable naming the worker executable.
pub const WORKER_ENV: &str = "FMUPOOL_WORKER";

/// Environment variable holding the default worker count.
pub const PROCESSES_ENV: &str = "FMUPOOL_PROCESSES";

/// File name of the bundled worker binary.
pub const WORKER_BIN: &str = "fmupool-worker";

/// Program launched for every worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProgram {
    /// Executable path.
    pub program: PathBuf,
    /// Command-line arguments.
    pub args: Vec<OsString>,
}

impl WorkerProgram {
    /// Creates a program without arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `$FMUPOOL_WORKER`, or the bundled worker next to the current executable.
    #[must_use]
    pub fn from_env() -> Self {
        if let Some(path) = std::env::var_os(WORKER_ENV) {
            return Self::new(path);
        }
        let file = format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX);
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file)));
        Self::new(sibling.unwrap_or_else(|| PathBuf::from(file)))
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub n_process: usize,
    /// Worker executable.
    pub worker: WorkerProgram,
    /// Replacement workers that may be spawned per batch after crashes.
    pub max_respawns: usize,
    /// Per-request deadline; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Bound of the channel carrying worker replies to the coordinator.
    pub event_capacity: usize,
    /// Platform passed to every worker.
    pub platform: PlatformKey,
    /// Time a worker gets to exit after `Shutdown` before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_process: 1,
            worker: WorkerProgram::from_env(),
            max_respawns: 1,
            request_timeout: None,
            event_capacity: 64,
            platform: PlatformKey::detect(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    /// Configuration with `n_process` workers; the respawn budget follows.
    #[must_use]
    pub fn new(n_process: usize) -> Self {
        Self {
            n_process,
            max_respawns: n_process,
            ..Default::default()
        }
    }

    /// Reads `FMUPOOL_PROCESSES` (and `FMUPOOL_WORKER`, via [`WorkerProgram::from_env`]).
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let Some(raw) = std::env::var_os(PROCESSES_ENV) else {
            return Ok(Self::default());
        };
        let raw = raw.to_string_lossy();
        let count = raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigurationError::InvalidWorkerCount { count: 0 })?;
        let config = Self::new(count);
        config.validate()?;
        Ok(config)
    }

    /// Set the worker executable.
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerProgram) -> Self {
        self.worker = worker;
        self
    }

    /// Set the per-batch respawn budget.
    #[must_use]
    pub const fn with_max_respawns(mut self, max_respawns: usize) -> Self {
        self.max_respawns = max_respawns;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the platform key passed to workers.
    #[must_use]
    pub fn with_platform(mut self, platform: PlatformKey) -> Self {
        self.platform = platform;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.n_process == 0 {
            return Err(ConfigurationError::InvalidWorkerCount { count: 0 });
        }
        Ok(())
    }
}
