//! # Job Message and Lease Sustainer
//!
//! Wraps one delivered queue message for the lifetime of a job. Owns the
//! message's lease: a background task periodically extends the processing
//! deadline while the job is running, and `ack`/`nack` are the mutually
//! exclusive terminal operations.
//!
//! The sustain loop and the terminal operations share one async mutex over
//! the status field. The loop re-checks status under that lock immediately
//! before every deadline extension, which is what guarantees no extension is
//! ever sent for an already-acknowledged message — a protocol violation on
//! most queue backends. Shutdown is cooperative (the loop polls the status on
//! a fixed tick) rather than signalled; a cancellation signal could land
//! between the last extension and the ack, which is exactly the race the
//! lock-and-recheck pattern removes.

use crate::error::{Error, Result};
use crate::job::progress::ProgressNotification;
use crate::messaging::message::ReceivedMessage;
use crate::messaging::puller::Puller;
use crate::variable::parse_embedded_json;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Message attribute carrying the download-file specification.
pub const DOWNLOAD_FILES_ATTR: &str = "download_files";

/// Lease-sustain settings. Zero values for delay/interval are filled in from
/// the subscription's ack deadline at startup (`delay = deadline`,
/// `interval = deadline * 0.8`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SustainerConfig {
    pub disabled: bool,
    /// Seconds each extension adds to the processing deadline.
    pub delay: f64,
    /// Seconds between extensions.
    pub interval: f64,
}

/// Job message lifecycle. Valid transitions: Running -> Done -> Acked, or
/// Running -> Acked directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Done,
    Acked,
}

/// One delivered message plus everything needed to manage its lease.
pub struct JobMessage {
    subscription: String,
    raw: ReceivedMessage,
    config: SustainerConfig,
    puller: Arc<dyn Puller>,
    status: Arc<Mutex<JobStatus>>,
}

impl JobMessage {
    pub fn new(
        subscription: impl Into<String>,
        raw: ReceivedMessage,
        config: SustainerConfig,
        puller: Arc<dyn Puller>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            raw,
            config,
            puller,
            status: Arc::new(Mutex::new(JobStatus::Running)),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.raw.message.message_id
    }

    pub fn ack_id(&self) -> &str {
        &self.raw.ack_id
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.raw.message.attributes
    }

    pub fn attr(&self, key: &str) -> Option<&String> {
        self.raw.message.attributes.get(key)
    }

    pub fn insert_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.raw
            .message
            .attributes
            .insert(key.into(), value.into());
    }

    /// Raw (base64) payload as delivered.
    pub fn data(&self) -> &str {
        &self.raw.message.data
    }

    /// Decoded payload, when the data field is valid base64 UTF-8.
    pub fn decoded_data(&self) -> Option<String> {
        self.raw
            .message
            .decoded_data()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_id().is_empty() {
            return Err(Error::invalid_job("no message id is given"));
        }
        Ok(())
    }

    /// The `download_files` attribute, JSON-coerced when it carries an
    /// encoded array or object.
    pub fn download_files(&self) -> Option<Value> {
        let raw = self.attr(DOWNLOAD_FILES_ATTR)?;
        Some(parse_embedded_json(raw).unwrap_or_else(|| Value::String(raw.clone())))
    }

    pub async fn status(&self) -> JobStatus {
        *self.status.lock().await
    }

    async fn running(status: &Mutex<JobStatus>) -> bool {
        *status.lock().await == JobStatus::Running
    }

    /// Acknowledge the message and transition to `Acked`. Holding the status
    /// lock across the queue call serializes this against the sustain loop.
    pub async fn ack(&self) -> Result<()> {
        let mut status = self.status.lock().await;
        self.puller
            .acknowledge(&self.subscription, &self.raw.ack_id)
            .await?;
        *status = JobStatus::Acked;
        debug!(message_id = %self.message_id(), "message acknowledged");
        Ok(())
    }

    /// Negative-acknowledge by resetting the deadline to zero, making the
    /// message immediately redeliverable. Transitions to `Done`.
    pub async fn nack(&self) -> Result<()> {
        let mut status = self.status.lock().await;
        self.puller
            .modify_ack_deadline(&self.subscription, &[self.raw.ack_id.clone()], 0)
            .await?;
        *status = JobStatus::Done;
        debug!(message_id = %self.message_id(), "message nacked for redelivery");
        Ok(())
    }

    /// Mark the job finished without a terminal queue call, stopping the
    /// sustain loop. Only applies while still running.
    pub async fn done(&self) {
        let mut status = self.status.lock().await;
        if *status == JobStatus::Running {
            *status = JobStatus::Done;
        }
    }

    /// A self-contained ack future sharing this message's status. Used by the
    /// deduplication gate to drain duplicate deliveries without borrowing the
    /// whole job.
    pub fn ack_future(&self) -> BoxFuture<'static, Result<()>> {
        let subscription = self.subscription.clone();
        let ack_id = self.raw.ack_id.clone();
        let message_id = self.message_id().to_string();
        let puller = self.puller.clone();
        let status = self.status.clone();
        Box::pin(async move {
            let mut status = status.lock().await;
            puller.acknowledge(&subscription, &ack_id).await?;
            *status = JobStatus::Acked;
            debug!(message_id = %message_id, "duplicate message acknowledged");
            Ok(())
        })
    }

    /// Spawn the lease-sustain loop. Runs until the status leaves `Running`;
    /// every `interval` seconds it extends the deadline by `delay` seconds,
    /// re-checking the status under the lock right before each extension.
    pub fn start_sustainer(
        &self,
        notification: Arc<ProgressNotification>,
    ) -> JoinHandle<()> {
        if self.config.disabled || self.config.interval <= 0.0 {
            info!(message_id = %self.message_id(), "lease sustainer disabled");
            return tokio::spawn(async {});
        }

        let subscription = self.subscription.clone();
        let ack_id = self.raw.ack_id.clone();
        let message_id = self.message_id().to_string();
        let delay = self.config.delay;
        let interval = Duration::from_secs_f64(self.config.interval);
        let puller = self.puller.clone();
        let status = self.status.clone();

        tokio::spawn(async move {
            debug!(message_id = %message_id, ?interval, delay, "lease sustainer started");
            loop {
                let deadline = tokio::time::Instant::now() + interval;
                // Tick toward the next extension, bailing out early once the
                // job stops running.
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if !Self::running(&status).await {
                        debug!(message_id = %message_id, "lease sustainer stopping");
                        return;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                }

                {
                    let status = status.lock().await;
                    // Never extend the deadline of an acknowledged message.
                    if *status != JobStatus::Running {
                        continue;
                    }
                    let result = puller
                        .modify_ack_deadline(
                            &subscription,
                            std::slice::from_ref(&ack_id),
                            delay.round() as u32,
                        )
                        .await;
                    if let Err(e) = result {
                        let message = format!(
                            "Failed to extend ack deadline for {subscription}: {e}"
                        );
                        error!(message_id = %message_id, error = %e, "lease extension failed");
                        notification.notify_working_error(&message_id, &message).await;
                    } else {
                        debug!(message_id = %message_id, delay, "lease extended");
                    }
                }
            }
        })
    }
}
