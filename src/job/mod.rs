//! # Job Pipeline
//!
//! One delivered message becomes one `Job`, which runs a fixed six-phase
//! pipeline: prepare a throwaway workspace and the command line, download the
//! input files, execute the command, upload whatever it left in the uploads
//! directory, acknowledge or negative-acknowledge the message based on the
//! outcome, and remove the workspace. Every phase transition is reported
//! through [`ProgressNotification`].
//!
//! The ack decision is driven by error classification: a retryable failure
//! nacks the message so another attempt can pick it up, a permanent failure
//! (bad message, bad template, non-zero exit) acknowledges it away so it can
//! never loop.

pub mod check;
pub mod progress;
pub mod step;

pub use check::{JobChecker, KvChecker, LockFileChecker, NoopChecker};
pub use progress::{ProgressConfig, ProgressNotification};
pub use step::{JobStep, JobStepStatus, Progress};

use crate::config::{CommandConfig, DownloadConfig, UploadConfig};
use crate::error::{Error, Result, Retryable};
use crate::messaging::JobMessage;
use crate::storage::Storage;
use crate::variable::{Variable, ARG_SEPARATOR};
use crate::worker::{Target, TransferFn, WorkerPool};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attribute asking the worker to merge the message payload (a JSON object)
/// into the attribute map before expansion.
pub const USE_DATA_AS_ATTRIBUTES_ATTR: &str = "use-data-as-attributes";

/// Attribute stamped with a fresh UUID per execution attempt, so downstream
/// consumers can tell redeliveries apart.
pub const EXEC_UUID_ATTR: &str = "exec_uuid";

/// Object-change notification attributes that can stand in for an explicit
/// `download_files` attribute.
const EVENT_TYPE_ATTR: &str = "eventType";
const BUCKET_ID_ATTR: &str = "bucketId";
const OBJECT_ID_ATTR: &str = "objectId";
const OBJECT_FINALIZE: &str = "OBJECT_FINALIZE";

pub struct Job {
    command: CommandConfig,
    message: JobMessage,
    notification: Arc<ProgressNotification>,
    storage: Arc<dyn Storage>,
    download: DownloadConfig,
    upload: UploadConfig,
    workspace_root: PathBuf,

    // Set during prepare.
    workspace: PathBuf,
    downloads_dir: PathBuf,
    uploads_dir: PathBuf,
    download_file_map: HashMap<String, String>,
    download_targets: Vec<Target>,
    remote_download_files: Value,
    local_download_files: Value,
    argv: Vec<String>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command: CommandConfig,
        message: JobMessage,
        notification: Arc<ProgressNotification>,
        storage: Arc<dyn Storage>,
        download: DownloadConfig,
        upload: UploadConfig,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            command,
            message,
            notification,
            storage,
            download,
            upload,
            workspace_root,
            workspace: PathBuf::new(),
            downloads_dir: PathBuf::new(),
            uploads_dir: PathBuf::new(),
            download_file_map: HashMap::new(),
            download_targets: Vec::new(),
            remote_download_files: Value::Null,
            local_download_files: Value::Null,
            argv: Vec::new(),
        }
    }

    pub fn message(&self) -> &JobMessage {
        &self.message
    }

    /// Command line produced by prepare. Empty before that phase has run.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn download_file_map(&self) -> &HashMap<String, String> {
        &self.download_file_map
    }

    pub fn local_download_files(&self) -> &Value {
        &self.local_download_files
    }

    pub fn remote_download_files(&self) -> &Value {
        &self.remote_download_files
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    /// Run the whole pipeline for this message. The returned error is the
    /// pipeline failure even when the terminal nack/ack itself succeeded;
    /// callers decide which errors end the subscription loop.
    pub async fn run(&mut self) -> Result<()> {
        let sustainer = self.message.start_sustainer(self.notification.clone());
        let phases = self.run_phases().await;
        let result = self.finalize(phases).await;
        self.cleanup().await;
        self.message.done().await;
        let _ = sustainer.await;
        result
    }

    async fn run_phases(&mut self) -> Result<()> {
        self.run_step(JobStep::Initializing).await?;
        self.run_step(JobStep::Downloading).await?;
        self.run_step(JobStep::Executing).await?;
        self.run_step(JobStep::Uploading).await?;
        Ok(())
    }

    /// Run one primary phase wrapped in its Starting/Success/Failure
    /// notifications.
    async fn run_step(&mut self, step: JobStep) -> Result<()> {
        self.notify(step, JobStepStatus::Starting, None).await;
        let result = match step {
            JobStep::Initializing => self.prepare().await,
            JobStep::Downloading => self.download_files().await,
            JobStep::Executing => self.execute().await,
            JobStep::Uploading => self.upload_files().await,
            // Terminal steps and cleanup have their own wrapping.
            _ => Ok(()),
        };
        match result {
            Ok(()) => {
                self.notify(step, JobStepStatus::Success, None).await;
                Ok(())
            }
            Err(e) => {
                self.notify(step, JobStepStatus::Failure, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn notify(&self, step: JobStep, status: JobStepStatus, message: Option<&str>) {
        self.notification
            .notify(
                self.message.message_id(),
                step,
                status,
                self.message.attributes(),
                message,
            )
            .await;
    }

    /// Initializing phase: validate the message, stage the workspace, resolve
    /// the download file list and build the command line.
    pub async fn prepare(&mut self) -> Result<()> {
        self.message.validate()?;
        self.promote_data_to_attributes()?;
        self.message
            .insert_attribute(EXEC_UUID_ATTR, Uuid::new_v4().to_string());

        self.setup_workspace().await?;
        self.setup_download_files()?;
        self.argv = self.build_argv()?;
        Ok(())
    }

    fn promote_data_to_attributes(&mut self) -> Result<()> {
        let requested = self
            .message
            .attr(USE_DATA_AS_ATTRIBUTES_ATTR)
            .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        if !requested {
            return Ok(());
        }

        let payload = self
            .message
            .decoded_data()
            .ok_or_else(|| Error::invalid_job("message data is not valid base64 UTF-8"))?;
        let parsed: Value = serde_json::from_str(&payload)
            .map_err(|e| Error::invalid_job(format!("message data is not valid JSON: {e}")))?;
        let object = parsed
            .as_object()
            .ok_or_else(|| Error::invalid_job("message data is not a JSON object"))?;

        for (key, value) in object {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.message.insert_attribute(key.clone(), rendered);
        }
        Ok(())
    }

    async fn setup_workspace(&mut self) -> Result<()> {
        let workspace = self
            .workspace_root
            .join(format!("workspace-{}", Uuid::new_v4()));
        let downloads = workspace.join("downloads");
        let uploads = workspace.join("uploads");
        tokio::fs::create_dir_all(&downloads).await?;
        tokio::fs::create_dir_all(&uploads).await?;
        debug!(workspace = %workspace.display(), "workspace created");
        self.workspace = workspace;
        self.downloads_dir = downloads;
        self.uploads_dir = uploads;
        Ok(())
    }

    fn setup_download_files(&mut self) -> Result<()> {
        self.remote_download_files = self.resolve_download_files()?;

        let mut urls = Vec::new();
        collect_urls(&self.remote_download_files, &mut urls);

        for url in urls {
            let (host, path) = parse_object_url(&url)?;
            let dest = self.downloads_dir.join(&host).join(&path);
            self.download_targets
                .push(Target::new(host, path, dest.clone()));
            self.download_file_map
                .insert(url, dest.to_string_lossy().into_owned());
        }

        let remote = self.remote_download_files.clone();
        self.local_download_files = self.copy_with_file_map(&remote);
        Ok(())
    }

    /// The download file list comes from the `download_files` attribute or,
    /// for messages generated by an object-change notification, from the
    /// finalize-event attribute triple. Carrying both is ambiguous and
    /// rejected rather than silently picking one.
    fn resolve_download_files(&self) -> Result<Value> {
        let from_attr = self.message.download_files();
        let from_event = self.download_files_from_event();

        match (from_attr, from_event) {
            (Some(_), Some(_)) => Err(Error::configuration(
                "download_files",
                "both the download_files attribute and an object notification are present",
            )),
            (Some(files), None) => Ok(files),
            (None, Some(files)) => Ok(files),
            (None, None) => Ok(Value::Null),
        }
    }

    fn download_files_from_event(&self) -> Option<Value> {
        if self.message.attr(EVENT_TYPE_ATTR).map(String::as_str) != Some(OBJECT_FINALIZE) {
            return None;
        }
        let bucket = self.message.attr(BUCKET_ID_ATTR)?;
        let object = self.message.attr(OBJECT_ID_ATTR)?;
        Some(json!([format!("gs://{bucket}/{object}")]))
    }

    /// Rebuild the download-files structure with every remote URL replaced by
    /// its local destination path.
    fn copy_with_file_map(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.copy_with_file_map(v)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.copy_with_file_map(v)).collect())
            }
            Value::String(s) => {
                Value::String(self.download_file_map.get(s).cloned().unwrap_or_default())
            }
            other => other.clone(),
        }
    }

    fn variable_data(&self) -> Value {
        json!({
            "workspace": self.workspace.to_string_lossy(),
            "downloads_dir": self.downloads_dir.to_string_lossy(),
            "uploads_dir": self.uploads_dir.to_string_lossy(),
            "download_files": self.local_download_files,
            "local_download_files": self.local_download_files,
            "remote_download_files": self.remote_download_files,
            "attrs": self.message.attributes(),
            "attributes": self.message.attributes(),
            "data": self.message.data(),
        })
    }

    /// Expand each template token, then split on the array separator so one
    /// token expanding to a flattened array becomes that many argv slots.
    fn extract(&self, variable: &Variable, tokens: &[String]) -> Result<Vec<String>> {
        let mut result = Vec::new();
        for token in tokens {
            let expanded = variable.expand(token)?;
            for part in expanded.split(variable.separator.as_str()) {
                result.push(part.to_string());
            }
        }
        Ok(result)
    }

    fn build_argv(&self) -> Result<Vec<String>> {
        let variable = Variable::with_separator(self.variable_data(), ARG_SEPARATOR);
        let template = &self.command.template;

        if self.command.options.is_empty() {
            let argv = self.extract(&variable, template)?;
            if argv.is_empty() || argv[0].is_empty() {
                return Err(Error::configuration(
                    "command.template",
                    "command template is empty",
                ));
            }
            return Ok(argv);
        }

        // First pass picks an entry from the options table; an expansion
        // failure or an empty key falls back to the default entry.
        let key = match self.extract(&variable, template) {
            Ok(values) => values.join(" "),
            Err(e) => {
                debug!(error = %e, "template expansion failed, using default command options");
                String::new()
            }
        };

        let entry = if key.is_empty() {
            self.command.options.get("default").ok_or_else(|| {
                Error::invalid_job("invalid command options key \"default\"")
            })?
        } else {
            self.command.options.get(&key).ok_or_else(|| {
                Error::invalid_job(format!("invalid command options key {key:?}"))
            })?
        };

        let argv = self.extract(&variable, entry)?;
        if argv.is_empty() || argv[0].is_empty() {
            return Err(Error::configuration(
                "command.options",
                format!("command options entry for {key:?} is empty"),
            ));
        }
        Ok(argv)
    }

    fn download_transfer(&self) -> TransferFn {
        let storage = self.storage.clone();
        Arc::new(move |target: Target| {
            let storage = storage.clone();
            Box::pin(async move {
                storage
                    .download(&target.bucket, &target.object, &target.local_path)
                    .await?;
                Ok(())
            })
        })
    }

    fn upload_transfer(&self) -> TransferFn {
        let storage = self.storage.clone();
        Arc::new(move |target: Target| {
            let storage = storage.clone();
            Box::pin(async move {
                storage
                    .upload(&target.bucket, &target.object, &target.local_path)
                    .await?;
                Ok(())
            })
        })
    }

    async fn download_files(&mut self) -> Result<()> {
        if self.download_targets.is_empty() {
            return Ok(());
        }
        let pool = WorkerPool::downloads(self.download.worker.clone(), self.download_transfer());
        pool.process(self.download_targets.clone()).await
    }

    async fn execute(&mut self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(Error::invalid_job("no command to execute"));
        }
        if self.command.dryrun {
            info!(command = ?self.argv, "dryrun, skipping execution");
            return Ok(());
        }

        info!(command = ?self.argv, "executing command");
        let output = tokio::process::Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .current_dir(&self.workspace)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            debug!(%stdout, "command stdout");
        }
        if !stderr.is_empty() {
            debug!(%stderr, "command stderr");
        }

        if output.status.success() {
            Ok(())
        } else {
            let status = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| output.status.to_string());
            let combined = format!("{stdout}{stderr}").trim().to_string();
            Err(Error::CommandFailed {
                status,
                output: combined,
            })
        }
    }

    /// Everything the command left under `uploads/` goes back to storage.
    /// The first path segment below the uploads directory names the bucket.
    async fn upload_files(&mut self) -> Result<()> {
        let mut targets = Vec::new();
        for entry in walkdir::WalkDir::new(&self.uploads_dir) {
            let entry = entry.map_err(|e| Error::Transfer {
                message: format!("failed to walk uploads directory: {e}"),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.uploads_dir)
                .map_err(|e| Error::Transfer {
                    message: format!("failed to relativize {}: {e}", entry.path().display()),
                })?;

            let mut components = rel.iter().map(|c| c.to_string_lossy().into_owned());
            let bucket = components.next().unwrap_or_default();
            let object = components.collect::<Vec<_>>().join("/");
            if bucket.is_empty() || object.is_empty() {
                return Err(Error::invalid_job(format!(
                    "upload file {} is not inside a bucket directory",
                    entry.path().display()
                )));
            }
            targets.push(Target::new(bucket, object, entry.path()));
        }

        if targets.is_empty() {
            return Ok(());
        }
        let pool = WorkerPool::uploads(self.upload.worker.clone(), self.upload_transfer());
        pool.process(targets).await
    }

    /// Terminal queue operation. Success acks; a retryable failure nacks for
    /// redelivery; a permanent failure is cancelled, meaning acked and
    /// dropped so it cannot loop. Queue failures here take precedence over
    /// the pipeline error because they end the subscription loop.
    async fn finalize(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.notify(JobStep::AckSending, JobStepStatus::Starting, None)
                    .await;
                match self.message.ack().await {
                    Ok(()) => {
                        self.notify(JobStep::AckSending, JobStepStatus::Success, None)
                            .await;
                        Ok(())
                    }
                    Err(e) => {
                        self.notify(
                            JobStep::AckSending,
                            JobStepStatus::Failure,
                            Some(&e.to_string()),
                        )
                        .await;
                        Err(e)
                    }
                }
            }
            Err(e) if e.retryable() => {
                self.notify(JobStep::NackSending, JobStepStatus::Starting, None)
                    .await;
                match self.message.nack().await {
                    Ok(()) => {
                        self.notify(JobStep::NackSending, JobStepStatus::Success, None)
                            .await;
                        Err(e)
                    }
                    Err(qe) => {
                        self.notify(
                            JobStep::NackSending,
                            JobStepStatus::Failure,
                            Some(&qe.to_string()),
                        )
                        .await;
                        Err(qe)
                    }
                }
            }
            Err(e) => {
                warn!(message_id = %self.message.message_id(), error = %e, "cancelling permanently failed job");
                self.notify(JobStep::Cancelling, JobStepStatus::Starting, None)
                    .await;
                match self.message.ack().await {
                    Ok(()) => {
                        self.notify(JobStep::Cancelling, JobStepStatus::Success, None)
                            .await;
                        Err(e)
                    }
                    Err(qe) => {
                        self.notify(
                            JobStep::Cancelling,
                            JobStepStatus::Failure,
                            Some(&qe.to_string()),
                        )
                        .await;
                        Err(qe)
                    }
                }
            }
        }
    }

    async fn cleanup(&mut self) {
        if self.workspace.as_os_str().is_empty() || !self.workspace.exists() {
            return;
        }
        self.notify(JobStep::Cleanup, JobStepStatus::Starting, None)
            .await;
        match tokio::fs::remove_dir_all(&self.workspace).await {
            Ok(()) => {
                self.notify(JobStep::Cleanup, JobStepStatus::Success, None)
                    .await
            }
            Err(e) => {
                self.notify(JobStep::Cleanup, JobStepStatus::Failure, Some(&e.to_string()))
                    .await
            }
        }
    }
}

/// Collect every string leaf of the download-files structure, in order.
/// Non-string scalars are not URLs and are skipped with a warning.
fn collect_urls(value: &Value, urls: &mut Vec<String>) {
    match value {
        Value::String(s) => urls.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                collect_urls(item, urls);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_urls(item, urls);
            }
        }
        Value::Null => {}
        other => warn!(value = %other, "ignoring non-string download file entry"),
    }
}

/// Split `scheme://host/path` into host (bucket) and path (object). The
/// scheme is not interpreted; the storage adapter decides what it talks to.
fn parse_object_url(url: &str) -> Result<(String, String)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::invalid_job(format!("Invalid download file URL: {url:?}")))?;
    if scheme.is_empty() {
        return Err(Error::invalid_job(format!(
            "Invalid download file URL: {url:?}"
        )));
    }
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    if host.is_empty() || path.is_empty() {
        return Err(Error::invalid_job(format!(
            "Invalid download file URL: {url:?}"
        )));
    }
    Ok((host.to_string(), path.to_string()))
}
