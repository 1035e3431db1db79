//! # Retry with Exponential Backoff
//!
//! One retry primitive shared by the transfer worker pool and the
//! backoff-wrapping decorators around the queue, publisher, and storage
//! seams. Delays grow exponentially from a configured initial interval up to
//! a cap; permanent errors (see [`Retryable`]) abort immediately instead of
//! burning the remaining attempts.

use crate::error::Retryable;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
    /// Upper bound on the delay between attempts.
    pub max_interval: Duration,
    /// Total attempt budget, including the first try. A value of 1 means no
    /// retries at all.
    pub max_tries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_interval: Duration::from_secs(300),
            max_tries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, max_tries: u32) -> Self {
        Self {
            initial_interval,
            max_tries,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, the attempt budget is exhausted, or it
    /// fails with a permanent error. Returns the last error on failure.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let budget = self.max_tries.max(1);
        let mut interval = self.initial_interval;
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.retryable() || attempt >= budget {
                        return Err(err);
                    }
                    tokio::time::sleep(interval).await;
                    interval = Duration::from_secs_f64(
                        (interval.as_secs_f64() * self.multiplier)
                            .min(self.max_interval.as_secs_f64()),
                    );
                }
            }
        }
    }
}
