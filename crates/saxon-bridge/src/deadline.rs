//! Deadline and cancellation wrapper for blocking transform steps.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Phase};

/// Run `fut` unless `cancel` fires first or `limit` expires.
pub(crate) async fn bounded<T, E, F>(
    phase: Phase,
    limit: Option<Duration>,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, E>>,
    BridgeError: From<E>,
{
    let limited = async {
        match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(BridgeError::from),
                Err(_) => Err(BridgeError::Timeout { phase, limit }),
            },
            None => fut.await.map_err(BridgeError::from),
        }
    };

    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(BridgeError::Cancelled { phase }),
        result = limited => result,
    }
}
