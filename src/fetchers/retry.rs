//! Bounded retry with exponential backoff for source fetches.
//!
//! Only [`FetchError::is_transient`] failures are retried. The delay between
//! attempts follows:
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
//! ```

use std::future::Future;
use std::time::Duration;

use rand::{Rng, rng};
use tokio::time::sleep;
use tracing::warn;

use crate::error::FetchError;

pub(crate) const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Run `operation`, retrying transient failures up to `max_retries` extra times.
pub(crate) async fn with_retry<T, F, Fut>(
    what: &str,
    max_retries: usize,
    base_delay: Duration,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0usize;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_transient() || attempt >= max_retries {
                    return Err(e);
                }
                attempt += 1;

                let shift = (attempt - 1).min(16) as u32;
                let delay = base_delay.saturating_mul(1 << shift).min(MAX_DELAY);
                let jitter_ms: u64 = rng().random_range(0..=250);
                let delay = delay + Duration::from_millis(jitter_ms);

                warn!(
                    what,
                    attempt,
                    max = max_retries,
                    ?delay,
                    error = %e,
                    "fetch attempt failed; backing off"
                );
                sleep(delay).await;
            }
        }
    }
}
