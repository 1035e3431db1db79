//! # Worker Process
//!
//! Ties the seams together: a puller feeding the subscription loop, a
//! publisher behind the progress notification, a storage backend for
//! transfers and the lock-file gate, and the configured deduplication
//! checker. Each delivered message becomes one [`Job`] routed through the
//! checker; job failures are logged and the loop keeps listening, while
//! queue failures end the loop since without a working queue there is
//! nothing left to do.

use crate::config::ProcessConfig;
use crate::error::{Error, Result};
use crate::job::check::JobChecker;
use crate::job::progress::ProgressNotification;
use crate::job::Job;
use crate::messaging::{Publisher, Puller};
use crate::storage::Storage;
use crate::subscription::JobSubscription;
use std::sync::Arc;
use tracing::error;

pub struct Process {
    config: ProcessConfig,
    puller: Arc<dyn Puller>,
    storage: Arc<dyn Storage>,
    notification: Arc<ProgressNotification>,
    checker: Arc<dyn JobChecker>,
}

impl Process {
    /// Wire up a process from validated config and the three backend seams.
    /// Completes the sustainer settings from the subscription's ack deadline.
    pub async fn new(
        mut config: ProcessConfig,
        puller: Arc<dyn Puller>,
        publisher: Arc<dyn Publisher>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.job.setup_sustainer(puller.as_ref()).await?;
        let notification = Arc::new(ProgressNotification::new(
            config.progress.clone(),
            publisher,
        ));
        let checker = config.job_check.build_checker(storage.clone())?;
        Ok(Self {
            config,
            puller,
            storage,
            notification,
            checker,
        })
    }

    pub async fn run(&self) -> Result<()> {
        let subscription = JobSubscription::new(self.config.job.clone(), self.puller.clone());

        let command = self.config.command.clone();
        let download = self.config.download.clone();
        let upload = self.config.upload.clone();
        let workspace_root = self.config.workspace_root();
        let notification = self.notification.clone();
        let storage = self.storage.clone();
        let checker = self.checker.clone();

        subscription
            .listen(move |message| {
                let command = command.clone();
                let download = download.clone();
                let upload = upload.clone();
                let workspace_root = workspace_root.clone();
                let notification = notification.clone();
                let storage = storage.clone();
                let checker = checker.clone();

                Box::pin(async move {
                    let job_id = message.message_id().to_string();
                    let ack = message.ack_future();
                    let mut job = Job::new(
                        command,
                        message,
                        notification,
                        storage,
                        download,
                        upload,
                        workspace_root,
                    );
                    let work = Box::pin(async move { job.run().await });

                    match checker.check(&job_id, ack, work).await {
                        Ok(()) => Ok(()),
                        // Losing the queue is fatal; everything else was
                        // already resolved by the job's own ack/nack.
                        Err(e @ Error::Queue { .. }) => Err(e),
                        Err(e) => {
                            error!(%job_id, error = %e, "job failed");
                            Ok(())
                        }
                    }
                })
            })
            .await
    }
}
