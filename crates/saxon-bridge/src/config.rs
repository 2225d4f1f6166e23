//! Bridge configuration.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::staging::{RetryPolicy, WorkerSource};
use crate::supervisor::{SimpleSpawner, WorkerSpawner};

pub const WORKER_ENV: &str = "SAXON_BRIDGE_WORKER";
pub const DEBUG_ENV: &str = "SAXON_BRIDGE_DEBUG";
pub const HANDSHAKE_TIMEOUT_ENV: &str = "SAXON_BRIDGE_HANDSHAKE_TIMEOUT_SECS";
pub const IO_TIMEOUT_ENV: &str = "SAXON_BRIDGE_IO_TIMEOUT_SECS";

/// Worker startup (JVM-based engines are slow to boot) is bounded separately from I/O.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no worker executable configured (set SAXON_BRIDGE_WORKER)")]
    MissingWorker,

    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Settings for one [`Client`](crate::Client).
#[derive(Clone)]
pub struct BridgeConfig {
    pub worker: WorkerSource,
    /// Passed to the worker as its only argument.
    pub debug: bool,
    pub handshake_timeout: Duration,
    /// Bounds each dial, the input writes, and the result drain. `None` waits forever.
    pub io_timeout: Option<Duration>,
    pub delete_retry: RetryPolicy,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl BridgeConfig {
    pub fn new(worker: WorkerSource) -> Self {
        Self {
            worker,
            debug: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            delete_retry: RetryPolicy::default(),
            spawner: Arc::new(SimpleSpawner),
        }
    }

    /// Build from `SAXON_BRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_env_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker = lookup(WORKER_ENV)
            .filter(|path| !path.is_empty())
            .ok_or(ConfigError::MissingWorker)?;
        let mut config = Self::new(WorkerSource::path(worker));

        if let Some(value) = lookup(DEBUG_ENV) {
            config.debug = parse_bool(DEBUG_ENV, &value)?;
        }
        if let Some(value) = lookup(HANDSHAKE_TIMEOUT_ENV) {
            config.handshake_timeout = Duration::from_secs(parse_secs(HANDSHAKE_TIMEOUT_ENV, &value)?);
        }
        if let Some(value) = lookup(IO_TIMEOUT_ENV) {
            config.io_timeout = match parse_secs(IO_TIMEOUT_ENV, &value)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
        }
        Ok(config)
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker = WorkerSource::path(path);
        self
    }

    pub fn with_embedded(mut self, bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        self.worker = WorkerSource::Embedded(bytes.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_delete_retry(mut self, policy: RetryPolicy) -> Self {
        self.delete_retry = policy;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("worker", &self.worker)
            .field("debug", &self.debug)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("io_timeout", &self.io_timeout)
            .field("delete_retry", &self.delete_retry)
            .finish_non_exhaustive()
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}
