//! # Queue Message Shapes
//!
//! Wire-level structures exchanged with the queue backend. The payload
//! travels base64-encoded with a free-form string attribute map, matching
//! the shape most pub/sub systems deliver.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One publishable / delivered message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubsubMessage {
    #[serde(default)]
    pub message_id: String,

    /// Base64-encoded payload.
    #[serde(default)]
    pub data: String,

    #[serde(default)]
    pub attributes: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_time: Option<DateTime<Utc>>,
}

impl PubsubMessage {
    /// Build a message from a raw payload, handling the base64 encoding.
    pub fn with_payload(payload: &[u8], attributes: HashMap<String, String>) -> Self {
        Self {
            data: BASE64.encode(payload),
            attributes,
            ..Self::default()
        }
    }

    /// Decode the payload. Returns `None` when the data field is not valid
    /// base64.
    pub fn decoded_data(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.data).ok()
    }
}

/// A message as delivered on a subscription, carrying the lease id the
/// consumer must use for acknowledge / deadline-extension calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceivedMessage {
    #[serde(default)]
    pub ack_id: String,
    #[serde(default)]
    pub message: PubsubMessage,
}

/// Subscription metadata, used once at startup to derive lease-sustain
/// defaults from the configured ack deadline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ack_deadline_seconds: u32,
}
