//! # Process Configuration
//!
//! One JSON document configures the whole worker: the command template and
//! options table, the subscription and its lease sustainer, the deduplication
//! gate, progress notification, transfer concurrency, and logging. Every
//! section is optional and defaults to something usable; `setup` fills in the
//! environment-derived pieces and `validate` rejects inconsistent sections
//! with the offending key path in the error.

use crate::error::{Error, Result};
use crate::job::check::{JobChecker, KvChecker, LockFileChecker, NoopChecker};
use crate::job::progress::ProgressConfig;
use crate::messaging::{Puller, SustainerConfig};
use crate::storage::Storage;
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Command template plus the optional dispatch table keyed by the first-pass
/// expansion of the template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub template: Vec<String>,
    pub options: HashMap<String, Vec<String>>,
    pub dryrun: bool,
}

impl CommandConfig {
    pub fn validate(&self) -> Result<()> {
        if self.template.is_empty() && self.options.is_empty() {
            return Err(Error::configuration(
                "command.template",
                "no command template or options given",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSubscriptionConfig {
    pub subscription: String,
    /// Seconds to sleep after an empty pull.
    pub pull_interval: u64,
    pub sustainer: SustainerConfig,
}

impl Default for JobSubscriptionConfig {
    fn default() -> Self {
        Self {
            subscription: String::new(),
            pull_interval: 10,
            sustainer: SustainerConfig::default(),
        }
    }
}

impl JobSubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subscription.is_empty() {
            return Err(Error::configuration(
                "job.subscription",
                "subscription is required",
            ));
        }
        Ok(())
    }

    /// Derive missing sustainer values from the subscription's ack deadline:
    /// each extension re-grants the full deadline, and extensions fire at 80%
    /// of it so one is always in flight before the lease expires.
    pub async fn setup_sustainer(&mut self, puller: &dyn Puller) -> Result<()> {
        if self.sustainer.disabled {
            info!(subscription = %self.subscription, "sustainer is disabled");
            return Ok(());
        }
        if self.sustainer.delay > 0.0 && self.sustainer.interval > 0.0 {
            return Ok(());
        }

        let sub = puller.get(&self.subscription).await?;
        let deadline = f64::from(sub.ack_deadline_seconds);
        if self.sustainer.delay <= 0.0 {
            self.sustainer.delay = deadline;
        }
        if self.sustainer.interval <= 0.0 {
            self.sustainer.interval = deadline * 0.8;
        }
        info!(
            subscription = %self.subscription,
            delay = self.sustainer.delay,
            interval = self.sustainer.interval,
            "sustainer configured from ack deadline"
        );
        Ok(())
    }
}

pub const JOB_CHECK_METHOD_NONE: &str = "none";
pub const JOB_CHECK_METHOD_KV: &str = "kv";
pub const JOB_CHECK_METHOD_LOCKFILE: &str = "lockfile";

const JOB_CHECK_METHODS: [&str; 3] = [
    JOB_CHECK_METHOD_NONE,
    JOB_CHECK_METHOD_KV,
    JOB_CHECK_METHOD_LOCKFILE,
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCheckConfig {
    pub method: String,
    /// KV: database file path. Lockfile: directory prefix inside the bucket.
    pub database: String,
    /// Lockfile: bucket holding the lock objects.
    pub bucket: String,
    /// KV: key prefix.
    pub prefix: String,
    /// Lockfile: staleness timeout, e.g. "6h", "30m", "45s".
    pub timeout: String,
}

impl JobCheckConfig {
    pub fn setup(&mut self) {
        if self.method.is_empty() {
            self.method = JOB_CHECK_METHOD_NONE.to_string();
        }
        match self.method.as_str() {
            JOB_CHECK_METHOD_KV => {
                if self.database.is_empty() {
                    self.database = "stagehand.db".to_string();
                }
                if self.prefix.is_empty() {
                    self.prefix = "jobs:".to_string();
                }
            }
            JOB_CHECK_METHOD_LOCKFILE => {
                if self.database.is_empty() {
                    self.database = "locks".to_string();
                }
                if self.timeout.is_empty() {
                    self.timeout = "6h".to_string();
                }
            }
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.method.as_str() {
            JOB_CHECK_METHOD_NONE | JOB_CHECK_METHOD_KV => Ok(()),
            JOB_CHECK_METHOD_LOCKFILE => {
                if self.bucket.is_empty() {
                    return Err(Error::configuration(
                        "job_check.bucket",
                        format!("bucket is required for method {:?}", self.method),
                    ));
                }
                parse_duration(&self.timeout).ok_or_else(|| {
                    Error::configuration(
                        "job_check.timeout",
                        format!("invalid timeout {:?}", self.timeout),
                    )
                })?;
                Ok(())
            }
            other => Err(Error::configuration(
                "job_check.method",
                format!("{other:?} is invalid, must be one of {JOB_CHECK_METHODS:?}"),
            )),
        }
    }

    pub fn build_checker(&self, storage: Arc<dyn Storage>) -> Result<Arc<dyn JobChecker>> {
        match self.method.as_str() {
            JOB_CHECK_METHOD_NONE => Ok(Arc::new(NoopChecker)),
            JOB_CHECK_METHOD_KV => Ok(Arc::new(KvChecker::new(&self.database, &self.prefix))),
            JOB_CHECK_METHOD_LOCKFILE => {
                let timeout = parse_duration(&self.timeout).ok_or_else(|| {
                    Error::configuration(
                        "job_check.timeout",
                        format!("invalid timeout {:?}", self.timeout),
                    )
                })?;
                Ok(Arc::new(LockFileChecker::new(
                    &self.bucket,
                    &self.database,
                    timeout,
                    storage,
                )))
            }
            other => Err(Error::configuration(
                "job_check.method",
                format!("{other:?} is invalid, must be one of {JOB_CHECK_METHODS:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub worker: WorkerConfig,
    /// Ask the storage adapter to derive content types from file extensions.
    pub content_type_by_ext: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub command: CommandConfig,
    pub job: JobSubscriptionConfig,
    pub job_check: JobCheckConfig,
    pub progress: ProgressConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub log: LogConfig,
    /// Parent directory for per-job workspaces. Empty means the system temp
    /// directory.
    pub workspace_root: String,
}

impl ProcessConfig {
    /// Read the JSON config document at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration("config", format!("failed to read {path}: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::configuration("config", format!("failed to parse {path}: {e}")))
    }

    /// Apply command-line args and the environment, then validate. `args`
    /// become the command template when given.
    pub fn setup(&mut self, args: Vec<String>) -> Result<()> {
        if !args.is_empty() {
            self.command.template = args;
        }
        self.apply_env();
        self.job_check.setup();
        self.progress.setup();

        self.command.validate()?;
        self.job.validate()?;
        self.job_check.validate()?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("JOB_SUBSCRIPTION") {
            self.job.subscription = v;
        }
        if let Ok(v) = std::env::var("PROGRESS_TOPIC") {
            self.progress.topic = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log.level = v;
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        if self.workspace_root.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.workspace_root)
        }
    }
}

/// Parse a duration written as `6h`, `30m`, `45s` or plain seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    let (value, unit) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], Some(c)),
        _ => (s, None),
    };
    let value: f64 = value.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let seconds = match unit {
        Some('h') => value * 3600.0,
        Some('m') => value * 60.0,
        Some('s') | None => value,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}
