//! # Object Storage Seam
//!
//! Capability trait over the object store holding job inputs and outputs.
//! The vendor client binding lives outside this crate; here we define the
//! contract the pipeline depends on, a distinct not-found error so callers
//! can branch on missing objects, and a backoff-wrapping decorator in the
//! same wrap-for-retry composition used on the queue seam.

use crate::error::Retryable;
use crate::resilience::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{object}")]
    NotFound { bucket: String, object: String },

    #[error("Storage {operation} failed for {bucket}/{object}: {message}")]
    Operation {
        operation: String,
        bucket: String,
        object: String,
        message: String,
    },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Retryable for StorageError {
    fn retryable(&self) -> bool {
        // A missing object will not appear by retrying the same transfer.
        !matches!(self, StorageError::NotFound { .. })
    }
}

impl StorageError {
    pub fn operation(
        operation: impl Into<String>,
        bucket: impl Into<String>,
        object: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        StorageError::Operation {
            operation: operation.into(),
            bucket: bucket.into(),
            object: object.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Metadata returned by `get` and `update`; `updated` feeds the lock-file
/// staleness check in the deduplication gate.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub object: String,
    pub updated: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn download(&self, bucket: &str, object: &str, dest: &Path)
        -> Result<(), StorageError>;

    async fn upload(&self, bucket: &str, object: &str, src: &Path) -> Result<(), StorageError>;

    async fn get(&self, bucket: &str, object: &str) -> Result<ObjectMetadata, StorageError>;

    async fn delete(&self, bucket: &str, object: &str) -> Result<(), StorageError>;

    /// Merge a metadata patch into the object and bump its update timestamp.
    async fn update(
        &self,
        bucket: &str,
        object: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectMetadata, StorageError>;
}

/// Decorator retrying every storage call with exponential backoff. Not-found
/// results pass through immediately (they are classified permanent).
pub struct BackoffStorage {
    inner: Arc<dyn Storage>,
    policy: RetryPolicy,
}

impl BackoffStorage {
    pub fn new(inner: Arc<dyn Storage>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Storage for BackoffStorage {
    async fn download(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<(), StorageError> {
        self.policy
            .retry(|| self.inner.download(bucket, object, dest))
            .await
    }

    async fn upload(&self, bucket: &str, object: &str, src: &Path) -> Result<(), StorageError> {
        self.policy
            .retry(|| self.inner.upload(bucket, object, src))
            .await
    }

    async fn get(&self, bucket: &str, object: &str) -> Result<ObjectMetadata, StorageError> {
        self.policy.retry(|| self.inner.get(bucket, object)).await
    }

    async fn delete(&self, bucket: &str, object: &str) -> Result<(), StorageError> {
        self.policy
            .retry(|| self.inner.delete(bucket, object))
            .await
    }

    async fn update(
        &self,
        bucket: &str,
        object: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectMetadata, StorageError> {
        self.policy
            .retry(|| self.inner.update(bucket, object, metadata.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyStorage {
        get_calls: AtomicU32,
        fail_first: u32,
        not_found: bool,
    }

    impl FlakyStorage {
        fn metadata(bucket: &str, object: &str) -> ObjectMetadata {
            ObjectMetadata {
                bucket: bucket.to_string(),
                object: object.to_string(),
                updated: Utc::now(),
                metadata: HashMap::new(),
            }
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn download(
            &self,
            _bucket: &str,
            _object: &str,
            _dest: &Path,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        async fn upload(
            &self,
            _bucket: &str,
            _object: &str,
            _src: &Path,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        async fn get(&self, bucket: &str, object: &str) -> Result<ObjectMetadata, StorageError> {
            let n = self.get_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.not_found {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                });
            }
            if n <= self.fail_first {
                Err(StorageError::operation(
                    "get",
                    bucket,
                    object,
                    "temporarily unavailable",
                ))
            } else {
                Ok(Self::metadata(bucket, object))
            }
        }

        async fn delete(&self, _bucket: &str, _object: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn update(
            &self,
            bucket: &str,
            object: &str,
            _metadata: HashMap<String, String>,
        ) -> Result<ObjectMetadata, StorageError> {
            Ok(Self::metadata(bucket, object))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn get_retries_transient_failures() {
        let inner = Arc::new(FlakyStorage {
            get_calls: AtomicU32::new(0),
            fail_first: 2,
            not_found: false,
        });
        let storage = BackoffStorage::new(
            inner.clone(),
            RetryPolicy::new(Duration::from_millis(10), 5),
        );
        let meta = storage.get("bucket1", "object1").await.unwrap();
        assert_eq!(meta.bucket, "bucket1");
        assert_eq!(inner.get_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let inner = Arc::new(FlakyStorage {
            get_calls: AtomicU32::new(0),
            fail_first: 0,
            not_found: true,
        });
        let storage = BackoffStorage::new(
            inner.clone(),
            RetryPolicy::new(Duration::from_millis(10), 5),
        );
        let err = storage.get("bucket1", "object1").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(inner.get_calls.load(Ordering::SeqCst), 1);
    }
}
