use std::fmt;
use std::time::Duration;

use crate::bridge::channels::ChannelError;
use crate::bridge::handshake::HandshakeError;
use crate::config::ConfigError;
use crate::staging::{StagingError, TeardownError};
use crate::supervisor::SpawnError;

/// Blocking step of a transform, used to report timeouts and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Dial,
    Write,
    Read,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Dial => "dial",
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to stage worker executable: {0}")]
    Staging(#[from] StagingError),

    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("worker handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("failed to stop worker: {0}")]
    Teardown(#[from] TeardownError),

    /// The transform completed but the worker could not be cleaned up.
    ///
    /// The result is kept so callers can still use it.
    #[error("transform completed but stopping the worker failed: {source}")]
    TeardownAfterTransform {
        output: Vec<u8>,
        #[source]
        source: TeardownError,
    },

    #[error("{phase} timed out after {limit:?}")]
    Timeout { phase: Phase, limit: Duration },

    #[error("transform cancelled during {phase}")]
    Cancelled { phase: Phase },
}

impl BridgeError {
    /// Result bytes that survived a teardown failure, if any.
    pub fn into_output(self) -> Option<Vec<u8>> {
        match self {
            Self::TeardownAfterTransform { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
