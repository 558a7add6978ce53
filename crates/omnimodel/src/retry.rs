//! Exponential backoff retry for recoverable failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Run `op` up to `1 + max_retries` times. Only recoverable error kinds
/// are retried; anything else fails on the first attempt. The delay
/// before retry N is `base_delay * 2^N` (N counted from zero), and the
/// final error propagates unchanged.
pub async fn retry_with_backoff<T, F, Fut>(
    mut op: F,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries || !err.is_recoverable() {
                    return Err(err);
                }
                let delay = base_delay * 2u32.saturating_pow(attempt);
                warn!(
                    "Attempt {} failed ({}), retrying in {:?}: {}",
                    attempt + 1,
                    err.kind(),
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
