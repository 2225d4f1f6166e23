//! Bridge client - runs one complete transform per call.
//!
//! Each call owns a fresh worker:
//!
//! ```text
//! start worker → decode ports → dial 3 channels → write descriptor + document
//!   → half-close both → drain result → stop worker
//! ```
//!
//! The worker is stopped on every exit path, including failures before the
//! result is read.

use std::fmt;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::channels::{ChannelError, ChannelSet, ResultEnd};
use crate::config::BridgeConfig;
use crate::deadline::bounded;
use crate::error::{BridgeError, Phase};
use crate::staging::WorkerSource;
use crate::supervisor::WorkerProcess;

/// Identifier attached to the tracing span of one transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformId(uuid::Uuid);

impl TransformId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TransformId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    config: BridgeConfig,
}

impl Client {
    pub fn new(worker: WorkerSource) -> Self {
        Self::from_config(BridgeConfig::new(worker))
    }

    /// Client whose worker runs with debug output enabled.
    pub fn with_debug(worker: WorkerSource) -> Self {
        Self::from_config(BridgeConfig::new(worker).with_debug(true))
    }

    pub fn with_executable(path: impl Into<PathBuf>) -> Self {
        Self::new(WorkerSource::path(path))
    }

    pub fn from_config(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Transform `document` with `descriptor` (e.g. an XSLT stylesheet).
    pub async fn transform(
        &self,
        document: &[u8],
        descriptor: &[u8],
    ) -> Result<Vec<u8>, BridgeError> {
        self.transform_with_cancel(document, descriptor, CancellationToken::new())
            .await
    }

    /// Like [`transform`](Self::transform), aborting the current step when
    /// `cancel` fires. The worker is still stopped.
    pub async fn transform_with_cancel(
        &self,
        document: &[u8],
        descriptor: &[u8],
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, BridgeError> {
        let id = TransformId::new();
        let span = tracing::info_span!("transform", transform_id = %id);

        async move {
            tracing::debug!(
                document_bytes = document.len(),
                descriptor_bytes = descriptor.len(),
                "Starting transform"
            );

            let mut worker = WorkerProcess::new(&self.config);
            let outcome = self.run(&mut worker, document, descriptor, &cancel).await;
            let stopped = worker.stop().await;

            match (outcome, stopped) {
                (Ok(output), Ok(())) => {
                    tracing::debug!(result_bytes = output.len(), "Transform complete");
                    Ok(output)
                }
                (Ok(output), Err(source)) => {
                    Err(BridgeError::TeardownAfterTransform { output, source })
                }
                (Err(e), Ok(())) => Err(e),
                (Err(e), Err(stop_err)) => {
                    tracing::warn!(error = %stop_err, "Failed to stop worker after transform error");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        worker: &mut WorkerProcess,
        document: &[u8],
        descriptor: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BridgeError> {
        let payload = worker
            .start_with_cancel(&self.config.worker, self.config.debug, cancel)
            .await?;

        let ports = payload.decode()?;
        tracing::debug!(
            document = ports.document,
            descriptor = ports.descriptor,
            result = ports.result,
            "Worker ports decoded"
        );

        let io_timeout = self.config.io_timeout;
        let channels = bounded(Phase::Dial, io_timeout, cancel, ChannelSet::dial(&ports)).await?;
        let result = bounded(
            Phase::Write,
            io_timeout,
            cancel,
            channels.send_inputs(descriptor, document),
        )
        .await?;

        let (output, end) = bounded(Phase::Read, io_timeout, cancel, async {
            Ok::<_, ChannelError>(result.drain().await)
        })
        .await?;

        match end {
            ResultEnd::Closed => {
                tracing::debug!(bytes = output.len(), "Result channel closed by worker");
            }
            ResultEnd::Error(e) => {
                tracing::debug!(bytes = output.len(), error = %e, "Result channel ended with transport error");
            }
        }
        Ok(output)
    }
}

/// Transform with a client configured from `SAXON_BRIDGE_*` environment variables.
pub async fn transform(document: &[u8], descriptor: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let config = BridgeConfig::from_env()?;
    Client::from_config(config)
        .transform(document, descriptor)
        .await
}
