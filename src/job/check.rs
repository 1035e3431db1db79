//! # Job Deduplication Gate
//!
//! At-least-once delivery means the same job can arrive twice. The gate wraps
//! the job body: before running it checks whether this job id has already
//! been seen, and a duplicate is acknowledged away instead of re-executed.
//!
//! Two real backends: a local key-value store for single-worker deployments,
//! and a lock file in object storage for fleets. The lock file is kept fresh
//! by a background touch loop so that a crashed worker's lock goes stale and
//! can be reaped by the next delivery.

use crate::error::{Error, Result};
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Gate around one job execution. `ack` disposes of a duplicate delivery;
/// `work` is the job body.
#[async_trait]
pub trait JobChecker: Send + Sync {
    async fn check(
        &self,
        job_id: &str,
        ack: BoxFuture<'static, Result<()>>,
        work: BoxFuture<'static, Result<()>>,
    ) -> Result<()>;
}

/// No deduplication: every delivery runs.
pub struct NoopChecker;

#[async_trait]
impl JobChecker for NoopChecker {
    async fn check(
        &self,
        _job_id: &str,
        _ack: BoxFuture<'static, Result<()>>,
        work: BoxFuture<'static, Result<()>>,
    ) -> Result<()> {
        work.await
    }
}

/// Local key-value gate. Records a status per prefixed job id; any recorded
/// status (executing, completed or error) makes later deliveries skip.
pub struct KvChecker {
    path: PathBuf,
    prefix: String,
}

impl KvChecker {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }

    fn open(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS job_status (
                 job_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )",
            [],
        )?;
        Ok(conn)
    }

    async fn get_status(&self, key: &str) -> Result<Option<String>> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<Option<String>> {
            let conn = Self::open(&path)?;
            conn.query_row(
                "SELECT status FROM job_status WHERE job_id = ?1",
                [&key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
        .map_err(|e| Error::Check {
            message: format!("status lookup task failed: {e}"),
        })?
        .map_err(|e| Error::Check {
            message: format!("failed to read job status: {e}"),
        })
    }

    async fn set_status(&self, key: &str, status: &str) -> Result<()> {
        let path = self.path.clone();
        let key = key.to_string();
        let status = status.to_string();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = Self::open(&path)?;
            conn.execute(
                "INSERT INTO job_status (job_id, status, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_id) DO UPDATE
                 SET status = excluded.status, updated_at = excluded.updated_at",
                rusqlite::params![key, status, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Check {
            message: format!("status update task failed: {e}"),
        })?
        .map_err(|e| Error::Check {
            message: format!("failed to record job status: {e}"),
        })
    }
}

#[async_trait]
impl JobChecker for KvChecker {
    async fn check(
        &self,
        job_id: &str,
        ack: BoxFuture<'static, Result<()>>,
        work: BoxFuture<'static, Result<()>>,
    ) -> Result<()> {
        let key = format!("{}{}", self.prefix, job_id);

        if let Some(status) = self.get_status(&key).await? {
            info!(%key, %status, "job already seen, skipping");
            if let Err(e) = ack.await {
                warn!(%key, error = %e, "failed to acknowledge skipped job");
            }
            return Ok(());
        }

        self.set_status(&key, "executing").await?;
        let result = work.await;

        let final_status = if result.is_ok() { "completed" } else { "error" };
        if let Err(e) = self.set_status(&key, final_status).await {
            warn!(%key, error = %e, "failed to record final job status");
        }
        result
    }
}

/// Object-storage lock gate for multi-worker fleets. One lock object per job
/// id; a touch loop refreshes its metadata while the job runs, and a lock
/// whose last touch is older than `timeout` is considered abandoned.
pub struct LockFileChecker {
    bucket: String,
    dir_path: String,
    timeout: Duration,
    storage: Arc<dyn Storage>,
}

impl LockFileChecker {
    pub fn new(
        bucket: impl Into<String>,
        dir_path: impl Into<String>,
        timeout: Duration,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            dir_path: dir_path.into(),
            timeout,
            storage,
        }
    }

    fn lock_object(&self, job_id: &str) -> String {
        format!("{}/{}.lock", self.dir_path, job_id)
    }

    /// Remove a lock left behind by a crashed worker. A lock younger than the
    /// timeout belongs to a live worker and the delivery must wait.
    async fn reap_if_stale(&self, object: &str) -> Result<()> {
        let meta = match self.storage.get(&self.bucket, object).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let deadline = meta.updated
            + chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero());
        if deadline > Utc::now() {
            return Err(Error::Locked {
                bucket: self.bucket.clone(),
                object: object.to_string(),
            });
        }

        info!(bucket = %self.bucket, %object, "reaping stale lock");
        match self.storage.delete(&self.bucket, object).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn acquire(&self, object: &str) -> Result<()> {
        // Re-check right before creating; the reap may have raced another
        // worker's acquisition.
        match self.storage.get(&self.bucket, object).await {
            Ok(_) => {
                return Err(Error::Locked {
                    bucket: self.bucket.clone(),
                    object: object.to_string(),
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let marker = std::env::temp_dir().join(format!("lock-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&marker, b"").await?;
        let result = self.storage.upload(&self.bucket, object, &marker).await;
        let _ = tokio::fs::remove_file(&marker).await;
        result?;
        debug!(bucket = %self.bucket, %object, "lock acquired");
        Ok(())
    }

    fn start_touching(
        &self,
        object: String,
        working: Arc<Mutex<bool>>,
    ) -> tokio::task::JoinHandle<()> {
        let bucket = self.bucket.clone();
        let storage = self.storage.clone();
        let interval = self.timeout / 10;

        tokio::spawn(async move {
            loop {
                let deadline = tokio::time::Instant::now() + interval;
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if !*working.lock().await {
                        return;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                }

                {
                    let working = working.lock().await;
                    if !*working {
                        return;
                    }
                    let mut patch = HashMap::new();
                    patch.insert("touched_at".to_string(), Utc::now().to_rfc3339());
                    match storage.update(&bucket, &object, patch).await {
                        Ok(_) => debug!(%bucket, %object, "lock touched"),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => warn!(%bucket, %object, error = %e, "failed to touch lock"),
                    }
                }
            }
        })
    }
}

#[async_trait]
impl JobChecker for LockFileChecker {
    async fn check(
        &self,
        job_id: &str,
        _ack: BoxFuture<'static, Result<()>>,
        work: BoxFuture<'static, Result<()>>,
    ) -> Result<()> {
        let object = self.lock_object(job_id);

        self.reap_if_stale(&object).await?;
        self.acquire(&object).await?;

        let working = Arc::new(Mutex::new(true));
        let toucher = self.start_touching(object.clone(), working.clone());

        let result = work.await;

        {
            let mut working = working.lock().await;
            *working = false;
        }
        let _ = toucher.await;

        match self.storage.delete(&self.bucket, &object).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(bucket = %self.bucket, %object, error = %e, "failed to release lock"),
        }

        result
    }
}
