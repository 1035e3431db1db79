//! Shared harness wiring the in-memory seams into a runnable job.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use stagehand_core::config::{CommandConfig, DownloadConfig, UploadConfig};
use stagehand_core::job::{Job, ProgressConfig, ProgressNotification};
use stagehand_core::messaging::{JobMessage, SustainerConfig};
use stagehand_core::test_helpers::{received_message, MemoryStorage, MockPublisher, MockPuller};
use stagehand_core::worker::WorkerConfig;
use tempfile::TempDir;

pub const SUBSCRIPTION: &str = "projects/test-proj/subscriptions/test-sub";
pub const PROGRESS_TOPIC: &str = "projects/test-proj/topics/test-progress";

pub struct Harness {
    pub puller: Arc<MockPuller>,
    pub publisher: Arc<MockPublisher>,
    pub storage: Arc<MemoryStorage>,
    pub root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            puller: Arc::new(MockPuller::new()),
            publisher: Arc::new(MockPublisher::new()),
            storage: Arc::new(MemoryStorage::new()),
            root: TempDir::new().unwrap(),
        }
    }

    pub fn notification(&self) -> Arc<ProgressNotification> {
        let config = ProgressConfig {
            topic: PROGRESS_TOPIC.to_string(),
            log_level: "info".to_string(),
            hostname: "testhost1".to_string(),
            attributes: HashMap::new(),
        };
        Arc::new(ProgressNotification::new(config, self.publisher.clone()))
    }

    pub fn message(
        &self,
        message_id: &str,
        payload: &[u8],
        attributes: HashMap<String, String>,
    ) -> JobMessage {
        JobMessage::new(
            SUBSCRIPTION,
            received_message(message_id, &format!("ack-{message_id}"), payload, attributes),
            SustainerConfig::default(),
            self.puller.clone(),
        )
    }

    /// A job with retry intervals zeroed out so failure tests don't sleep.
    pub fn job(&self, command: CommandConfig, message: JobMessage) -> Job {
        let worker = WorkerConfig {
            workers: 2,
            max_tries: 1,
            initial_interval_secs: 0,
        };
        Job::new(
            command,
            message,
            self.notification(),
            self.storage.clone(),
            DownloadConfig {
                worker: worker.clone(),
            },
            UploadConfig {
                worker,
                content_type_by_ext: false,
            },
            self.root.path().to_path_buf(),
        )
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }
}

pub fn command(template: &[&str]) -> CommandConfig {
    CommandConfig {
        template: template.iter().map(|s| s.to_string()).collect(),
        options: HashMap::new(),
        dryrun: false,
    }
}

pub fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
