//! # Progress Notification
//!
//! Reports every step transition twice: always to the local log, and — when
//! the event's level clears the configured threshold — to the progress topic
//! as a small message whose attributes downstream consumers filter on. The
//! publish is best-effort; a notification failure never fails the job itself.

use crate::job::step::{JobStep, JobStepStatus, Progress};
use crate::messaging::{PubsubMessage, Publisher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};

/// Attribute values are capped so one oversized command output can't make
/// the notification message unpublishable.
const MAX_ATTRIBUTE_BYTES: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Destination topic. Empty disables publishing (logging still happens).
    pub topic: String,
    /// Minimum level that gets published: debug, info, warning or error.
    pub log_level: String,
    /// Reported in the `host` attribute so consumers can tell workers apart.
    pub hostname: String,
    /// Extra attributes stamped onto every notification.
    pub attributes: HashMap<String, String>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            log_level: "info".to_string(),
            hostname: String::new(),
            attributes: HashMap::new(),
        }
    }
}

impl ProgressConfig {
    /// Fill in defaults that need the environment: the hostname attribute.
    pub fn setup(&mut self) {
        if self.log_level.is_empty() {
            self.log_level = "info".to_string();
        }
        if self.hostname.is_empty() {
            self.hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s {
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "fatal" => Some(Level::ERROR),
        _ => None,
    }
}

/// Wire-format name of a level. Uses "warning" rather than "warn" to match
/// what consumers of the progress topic already parse.
fn level_name(level: Level) -> &'static str {
    if level == Level::ERROR {
        "error"
    } else if level == Level::WARN {
        "warning"
    } else if level == Level::INFO {
        "info"
    } else {
        "debug"
    }
}

fn truncate_attr(value: &str) -> String {
    if value.len() <= MAX_ATTRIBUTE_BYTES {
        return value.to_string();
    }
    let mut end = MAX_ATTRIBUTE_BYTES;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

pub struct ProgressNotification {
    config: ProgressConfig,
    publisher: Arc<dyn Publisher>,
    threshold: Level,
}

impl ProgressNotification {
    pub fn new(config: ProgressConfig, publisher: Arc<dyn Publisher>) -> Self {
        // An unparsable level falls back to info rather than erroring; the
        // config layer validates before we get here.
        let threshold = parse_level(&config.log_level).unwrap_or(Level::INFO);
        Self {
            config,
            publisher,
            threshold,
        }
    }

    /// Report one step transition. `message` overrides the default
    /// `"<STEP> <STATUS>"` payload, typically with the failure text.
    pub async fn notify(
        &self,
        job_message_id: &str,
        step: JobStep,
        status: JobStepStatus,
        base_attrs: &HashMap<String, String>,
        message: Option<&str>,
    ) {
        let level = step.log_level_for(status);
        let default_data = format!("{step} {status}");
        let data = message.unwrap_or(&default_data);

        if level == Level::ERROR {
            error!(job_message_id, step = %step, status = %status, "{data}");
        } else if level == Level::WARN {
            warn!(job_message_id, step = %step, status = %status, "{data}");
        } else if level == Level::INFO {
            info!(job_message_id, step = %step, status = %status, "{data}");
        } else {
            debug!(job_message_id, step = %step, status = %status, "{data}");
        }

        // tracing orders ERROR lowest, so "at least as severe" is `<=`.
        if level > self.threshold {
            return;
        }

        let mut attrs = HashMap::new();
        attrs.insert("step".to_string(), step.to_string());
        attrs.insert("step_status".to_string(), status.to_string());
        attrs.insert(
            "progress".to_string(),
            step.progress_for(status).code().to_string(),
        );
        attrs.insert(
            "completed".to_string(),
            step.completed(status).to_string(),
        );
        attrs.insert("level".to_string(), level_name(level).to_string());
        self.publish(job_message_id, data, base_attrs, attrs).await;
    }

    /// Out-of-band error report from the lease sustainer: the job is still
    /// working, but its deadline extension failed.
    pub async fn notify_working_error(&self, job_message_id: &str, message: &str) {
        error!(job_message_id, "{message}");
        let mut attrs = HashMap::new();
        attrs.insert("progress".to_string(), Progress::Working.code().to_string());
        attrs.insert("completed".to_string(), "false".to_string());
        attrs.insert("level".to_string(), "error".to_string());
        self.publish(job_message_id, message, &HashMap::new(), attrs)
            .await;
    }

    async fn publish(
        &self,
        job_message_id: &str,
        data: &str,
        base_attrs: &HashMap<String, String>,
        mut attrs: HashMap<String, String>,
    ) {
        if self.config.topic.is_empty() {
            return;
        }

        for (k, v) in &self.config.attributes {
            attrs.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in base_attrs {
            attrs.entry(k.clone()).or_insert_with(|| v.clone());
        }
        attrs.insert("host".to_string(), self.config.hostname.clone());
        attrs.insert("job_message_id".to_string(), job_message_id.to_string());
        let attrs: HashMap<String, String> = attrs
            .into_iter()
            .map(|(k, v)| (k, truncate_attr(&v)))
            .collect();

        let message = PubsubMessage::with_payload(data.as_bytes(), attrs);
        if let Err(e) = self.publisher.publish(&self.config.topic, message).await {
            warn!(topic = %self.config.topic, error = %e, "failed to publish progress notification");
        }
    }
}
