//! # Job Subscription Loop
//!
//! Serial consumer: pull at most one message, hand it to the job handler,
//! pull the next. Concurrency comes from running more worker processes, not
//! from overlapping jobs inside one process. An empty pull sleeps for the
//! configured interval before trying again; a handler error ends the loop
//! and surfaces to the caller.

use crate::config::JobSubscriptionConfig;
use crate::error::Result;
use crate::messaging::{JobMessage, Puller};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct JobSubscription {
    config: JobSubscriptionConfig,
    puller: Arc<dyn Puller>,
}

impl JobSubscription {
    pub fn new(config: JobSubscriptionConfig, puller: Arc<dyn Puller>) -> Self {
        Self { config, puller }
    }

    pub async fn listen<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(JobMessage) -> BoxFuture<'static, Result<()>>,
    {
        info!(subscription = %self.config.subscription, "listening for jobs");
        loop {
            let delivered = self.puller.pull(&self.config.subscription, 1).await?;
            match delivered.into_iter().next() {
                None => {
                    debug!(subscription = %self.config.subscription, "no message delivered");
                    tokio::time::sleep(Duration::from_secs(self.config.pull_interval)).await;
                }
                Some(raw) => {
                    let message = JobMessage::new(
                        &self.config.subscription,
                        raw,
                        self.config.sustainer.clone(),
                        self.puller.clone(),
                    );
                    handler(message).await?;
                }
            }
        }
    }
}
