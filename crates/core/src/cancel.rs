//! Cooperative cancellation helpers.
//!
//! Every wait point in the adapters goes through these so a stop request
//! interrupts sleeps and in-flight requests alike.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::OutpaintError;

/// Fail with [`OutpaintError::Cancelled`] if the token has fired.
pub fn ensure_active(cancel: &CancellationToken) -> Result<(), OutpaintError> {
    if cancel.is_cancelled() {
        Err(OutpaintError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), OutpaintError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OutpaintError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Drive `fut` to completion unless cancelled first.
pub async fn run_or_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, OutpaintError>
where
    F: Future<Output = Result<T, OutpaintError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OutpaintError::Cancelled),
        result = fut => result,
    }
}
