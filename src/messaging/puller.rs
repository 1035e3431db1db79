//! # Queue Consumer Seam
//!
//! `Puller` is the capability trait over the queue backend's subscriber API.
//! The concrete vendor client lives outside this crate; in here the trait has
//! two in-tree implementations: the backoff decorator below and the recording
//! mock in `test_helpers`.

use crate::error::Result;
use crate::messaging::message::{ReceivedMessage, SubscriptionInfo};
use crate::resilience::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Puller: Send + Sync {
    /// Long-poll for up to `max_messages` messages. An empty vec means the
    /// server timed out with nothing to deliver.
    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>>;

    /// Permanently remove a message from the subscription.
    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()>;

    /// Extend (or, with zero seconds, reset) the processing deadline of the
    /// given leases.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<()>;

    /// Fetch subscription metadata (ack deadline) for sustainer defaults.
    async fn get(&self, subscription: &str) -> Result<SubscriptionInfo>;
}

/// Decorator retrying every queue call with exponential backoff before the
/// error is allowed to surface as fatal.
pub struct BackoffPuller {
    inner: Arc<dyn Puller>,
    policy: RetryPolicy,
}

impl BackoffPuller {
    pub fn new(inner: Arc<dyn Puller>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Puller for BackoffPuller {
    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.policy
            .retry(|| self.inner.pull(subscription, max_messages))
            .await
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        self.policy
            .retry(|| self.inner.acknowledge(subscription, ack_id))
            .await
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<()> {
        self.policy
            .retry(|| {
                self.inner
                    .modify_ack_deadline(subscription, ack_ids, ack_deadline_seconds)
            })
            .await
    }

    async fn get(&self, subscription: &str) -> Result<SubscriptionInfo> {
        self.policy.retry(|| self.inner.get(subscription)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyPuller {
        acknowledge_calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Puller for FlakyPuller {
        async fn pull(
            &self,
            _subscription: &str,
            _max_messages: usize,
        ) -> Result<Vec<ReceivedMessage>> {
            Ok(vec![])
        }

        async fn acknowledge(&self, _subscription: &str, _ack_id: &str) -> Result<()> {
            let n = self.acknowledge_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(Error::queue("acknowledge", "temporarily unavailable"))
            } else {
                Ok(())
            }
        }

        async fn modify_ack_deadline(
            &self,
            _subscription: &str,
            _ack_ids: &[String],
            _ack_deadline_seconds: u32,
        ) -> Result<()> {
            Ok(())
        }

        async fn get(&self, subscription: &str) -> Result<SubscriptionInfo> {
            Ok(SubscriptionInfo {
                name: subscription.to_string(),
                ack_deadline_seconds: 60,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_retries_transient_failures() {
        let inner = Arc::new(FlakyPuller {
            acknowledge_calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let puller =
            BackoffPuller::new(inner.clone(), RetryPolicy::new(Duration::from_millis(10), 3));
        puller.acknowledge("sub1", "ack-1").await.unwrap();
        assert_eq!(inner.acknowledge_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_gives_up_after_the_budget() {
        let inner = Arc::new(FlakyPuller {
            acknowledge_calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let puller =
            BackoffPuller::new(inner.clone(), RetryPolicy::new(Duration::from_millis(10), 3));
        assert!(puller.acknowledge("sub1", "ack-1").await.is_err());
        assert_eq!(inner.acknowledge_calls.load(Ordering::SeqCst), 3);
    }
}
