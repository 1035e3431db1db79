//! # Target Worker Pool
//!
//! Bounded pool of concurrent workers draining a shared queue of file
//! transfer targets. Each target is attempted with exponential-backoff retry;
//! a target that still fails after its retry budget records its error and the
//! worker moves on, so one bad file never aborts its siblings. The aggregate
//! result joins every per-target failure, in target order, with newlines.

use crate::error::{Error, Result};
use crate::resilience::RetryPolicy;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Concurrency and retry budget for one transfer phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,
    pub max_tries: u32,
    /// Initial backoff delay between retries of one target, in seconds.
    pub initial_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_tries: 3,
            initial_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.initial_interval_secs),
            self.max_tries,
        )
    }

    /// At least one worker always runs.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

/// One file transfer unit.
#[derive(Debug, Clone)]
pub struct Target {
    pub bucket: String,
    pub object: String,
    pub local_path: PathBuf,
}

impl Target {
    pub fn new(
        bucket: impl Into<String>,
        object: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            local_path: local_path.into(),
        }
    }
}

/// The transfer operation applied to each target (download or upload).
pub type TransferFn = Arc<dyn Fn(Target) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A pool bound to one transfer direction.
pub struct WorkerPool {
    name: &'static str,
    config: WorkerConfig,
    transfer: TransferFn,
    /// Create the destination's parent directory before transferring
    /// (download direction only).
    ensure_local_dirs: bool,
}

impl WorkerPool {
    pub fn downloads(config: WorkerConfig, transfer: TransferFn) -> Self {
        Self {
            name: "download",
            config,
            transfer,
            ensure_local_dirs: true,
        }
    }

    pub fn uploads(config: WorkerConfig, transfer: TransferFn) -> Self {
        Self {
            name: "upload",
            config,
            transfer,
            ensure_local_dirs: false,
        }
    }

    /// Drain `targets` through the pool. Blocks until every worker finishes.
    /// Returns the newline-joined failure messages in target order, or `Ok`
    /// when every target transferred.
    pub async fn process(&self, targets: Vec<Target>) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }

        let count = targets.len();
        let (tx, rx) = mpsc::channel::<(usize, Target)>(count);
        for entry in targets.into_iter().enumerate() {
            // Capacity equals the target count, so this never blocks.
            tx.send(entry).await.map_err(|_| Error::Transfer {
                message: format!("{} queue closed before loading targets", self.name),
            })?;
        }
        drop(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let errors: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(vec![None; count]));
        let policy = self.config.retry_policy();

        let handles: Vec<_> = (0..self.config.worker_count())
            .map(|worker| {
                let rx = rx.clone();
                let errors = errors.clone();
                let policy = policy.clone();
                let transfer = self.transfer.clone();
                let ensure_dirs = self.ensure_local_dirs;
                let name = self.name;
                tokio::spawn(async move {
                    loop {
                        // Non-blocking take: an empty queue ends the worker.
                        let next = { rx.lock().await.try_recv() };
                        let (index, target) = match next {
                            Ok(entry) => entry,
                            Err(_) => break,
                        };
                        debug!(worker, %name, bucket = %target.bucket, object = %target.object, "starting transfer");

                        if ensure_dirs {
                            if let Some(parent) = target.local_path.parent() {
                                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                                    warn!(worker, %name, error = %e, "failed to create destination directory");
                                    errors.lock()[index] = Some(e.to_string());
                                    continue;
                                }
                            }
                        }

                        let result = policy.retry(|| (transfer)(target.clone())).await;
                        match result {
                            Ok(()) => {
                                debug!(worker, %name, bucket = %target.bucket, object = %target.object, "transfer finished");
                            }
                            Err(e) => {
                                warn!(worker, %name, bucket = %target.bucket, object = %target.object, error = %e, "transfer failed");
                                errors.lock()[index] = Some(e.to_string());
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.map_err(|e| Error::Transfer {
                message: format!("{} worker panicked: {e}", self.name),
            })?;
        }

        let messages: Vec<String> = errors.lock().iter().flatten().cloned().collect();
        if messages.is_empty() {
            Ok(())
        } else {
            Err(Error::Transfer {
                message: messages.join("\n"),
            })
        }
    }
}
