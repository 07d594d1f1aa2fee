//! Capped exponential backoff for transient store errors.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Maximum attempts per operation (the first call plus two retries).
pub(crate) const MAX_ATTEMPTS: u32 = 3;

/// Backoff before retry `attempt` (1-based): 100 ms growing to a 1 s cap.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(100);
    let factor = 10u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(Duration::from_secs(1))
}

/// Run `op`, retrying transient errors up to [`MAX_ATTEMPTS`] total tries.
/// Non-transient errors return immediately.
pub(crate) async fn with_retry<T, F, Fut>(op_name: &str, op: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
