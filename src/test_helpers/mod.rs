//! # Test Helpers
//!
//! In-memory implementations of the three backend seams, shared between the
//! colocated unit tests and the integration suite. All of them record their
//! invocations so tests can assert on exactly which queue and storage calls
//! the pipeline made.

use crate::error::{Error, Result};
use crate::messaging::{
    PubsubMessage, Publisher, Puller, ReceivedMessage, SubscriptionInfo,
};
use crate::storage::{ObjectMetadata, Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Build a delivered message from raw parts, base64-encoding the payload.
pub fn received_message(
    message_id: &str,
    ack_id: &str,
    payload: &[u8],
    attributes: HashMap<String, String>,
) -> ReceivedMessage {
    let mut message = PubsubMessage::with_payload(payload, attributes);
    message.message_id = message_id.to_string();
    ReceivedMessage {
        ack_id: ack_id.to_string(),
        message,
    }
}

/// Scripted queue consumer. Each `pull` pops the next scripted response;
/// an exhausted script returns a queue error, which deterministically ends
/// a subscription loop under test.
#[derive(Default)]
pub struct MockPuller {
    pulls: Mutex<VecDeque<Result<Vec<ReceivedMessage>>>>,
    acks: Mutex<Vec<(String, String)>>,
    mads: Mutex<Vec<(String, Vec<String>, u32)>>,
    get_calls: AtomicU32,
    pub ack_deadline_seconds: u32,
    pub fail_acknowledge: AtomicBool,
    pub fail_modify_ack_deadline: AtomicBool,
}

impl MockPuller {
    pub fn new() -> Self {
        Self {
            ack_deadline_seconds: 60,
            ..Self::default()
        }
    }

    pub fn script_pull(&self, messages: Vec<ReceivedMessage>) {
        self.pulls.lock().push_back(Ok(messages));
    }

    pub fn script_pull_error(&self, message: &str) {
        self.pulls
            .lock()
            .push_back(Err(Error::queue("pull", message)));
    }

    /// Acknowledged (subscription, ack_id) pairs, in call order.
    pub fn acks(&self) -> Vec<(String, String)> {
        self.acks.lock().clone()
    }

    /// Deadline modifications as (subscription, ack_ids, seconds), in call
    /// order. Zero seconds is a nack.
    pub fn mads(&self) -> Vec<(String, Vec<String>, u32)> {
        self.mads.lock().clone()
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Puller for MockPuller {
    async fn pull(&self, _subscription: &str, _max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.pulls
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::queue("pull", "no more scripted responses")))
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        if self.fail_acknowledge.load(Ordering::SeqCst) {
            return Err(Error::queue("acknowledge", "injected failure"));
        }
        self.acks
            .lock()
            .push((subscription.to_string(), ack_id.to_string()));
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<()> {
        if self.fail_modify_ack_deadline.load(Ordering::SeqCst) {
            return Err(Error::queue("modify_ack_deadline", "injected failure"));
        }
        self.mads.lock().push((
            subscription.to_string(),
            ack_ids.to_vec(),
            ack_deadline_seconds,
        ));
        Ok(())
    }

    async fn get(&self, subscription: &str) -> Result<SubscriptionInfo> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SubscriptionInfo {
            name: subscription.to_string(),
            ack_deadline_seconds: self.ack_deadline_seconds,
        })
    }
}

/// Recording publisher for progress-notification assertions.
#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<(String, PubsubMessage)>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, PubsubMessage)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String> {
        let mut published = self.published.lock();
        published.push((topic.to_string(), message));
        Ok(format!("pub-{}", published.len()))
    }
}

struct StoredObject {
    data: Vec<u8>,
    updated: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

/// In-memory object store backing the transfer and lock-file tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    pub fail_downloads: AtomicBool,
    pub fail_uploads: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(&self, bucket: &str, object: &str, data: &[u8]) {
        self.objects.lock().insert(
            (bucket.to_string(), object.to_string()),
            StoredObject {
                data: data.to_vec(),
                updated: Utc::now(),
                metadata: HashMap::new(),
            },
        );
    }

    pub fn object(&self, bucket: &str, object: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), object.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Backdate an object, for lock staleness tests.
    pub fn set_updated(&self, bucket: &str, object: &str, updated: DateTime<Utc>) {
        if let Some(stored) = self
            .objects
            .lock()
            .get_mut(&(bucket.to_string(), object.to_string()))
        {
            stored.updated = updated;
        }
    }

    fn not_found(bucket: &str, object: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn download(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> std::result::Result<(), StorageError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(StorageError::operation(
                "download",
                bucket,
                object,
                "injected failure",
            ));
        }
        let data = {
            let objects = self.objects.lock();
            objects
                .get(&(bucket.to_string(), object.to_string()))
                .ok_or_else(|| Self::not_found(bucket, object))?
                .data
                .clone()
        };
        tokio::fs::write(dest, data).await?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        object: &str,
        src: &Path,
    ) -> std::result::Result<(), StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::operation(
                "upload",
                bucket,
                object,
                "injected failure",
            ));
        }
        let data = tokio::fs::read(src).await?;
        self.put_object(bucket, object, &data);
        Ok(())
    }

    async fn get(
        &self,
        bucket: &str,
        object: &str,
    ) -> std::result::Result<ObjectMetadata, StorageError> {
        let objects = self.objects.lock();
        let stored = objects
            .get(&(bucket.to_string(), object.to_string()))
            .ok_or_else(|| Self::not_found(bucket, object))?;
        Ok(ObjectMetadata {
            bucket: bucket.to_string(),
            object: object.to_string(),
            updated: stored.updated,
            metadata: stored.metadata.clone(),
        })
    }

    async fn delete(&self, bucket: &str, object: &str) -> std::result::Result<(), StorageError> {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), object.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(bucket, object))
    }

    async fn update(
        &self,
        bucket: &str,
        object: &str,
        metadata: HashMap<String, String>,
    ) -> std::result::Result<ObjectMetadata, StorageError> {
        let mut objects = self.objects.lock();
        let stored = objects
            .get_mut(&(bucket.to_string(), object.to_string()))
            .ok_or_else(|| Self::not_found(bucket, object))?;
        stored.metadata.extend(metadata);
        stored.updated = Utc::now();
        Ok(ObjectMetadata {
            bucket: bucket.to_string(),
            object: object.to_string(),
            updated: stored.updated,
            metadata: stored.metadata.clone(),
        })
    }
}
