//! # Progress Topic Seam
//!
//! `Publisher` is the capability trait the progress-notification layer emits
//! through. Mirrors the puller seam: vendor client outside the crate, a
//! backoff decorator and a recording mock inside it.

use crate::error::Result;
use crate::messaging::message::PubsubMessage;
use crate::resilience::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message to a topic, returning the server-assigned
    /// message id.
    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String>;
}

/// Decorator retrying publishes with exponential backoff.
pub struct BackoffPublisher {
    inner: Arc<dyn Publisher>,
    policy: RetryPolicy,
}

impl BackoffPublisher {
    pub fn new(inner: Arc<dyn Publisher>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Publisher for BackoffPublisher {
    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String> {
        self.policy
            .retry(|| self.inner.publish(topic, message.clone()))
            .await
    }
}
