//! Retry with exponential back-off and bounded jitter, shared by the
//! embedder and cluster clients and the ingest workers.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Back-off cap; a retry never sleeps longer than this.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first; 0 disables retries.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts, base_delay }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped, plus uniform jitter in `[0, base/2)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF);
        let jitter_ceil = self.base_delay.as_millis() as u64 / 2;
        let jitter = if jitter_ceil == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceil))
        };
        exp + jitter
    }

    /// Run `op`, retrying retryable errors up to `attempts` times. A
    /// rate-limit error's server-provided delay overrides the back-off.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.retryable() && attempt < self.attempts => {
                    let delay = e.retry_after().unwrap_or_else(|| self.delay_for(attempt));
                    tracing::debug!(
                        kind = e.kind(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
