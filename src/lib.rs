//! # Stagehand Core
//!
//! A message-driven job runner: it consumes jobs from a pub/sub subscription,
//! stages their input files from object storage into a throwaway workspace,
//! executes a configured command, uploads whatever the command produced, and
//! acknowledges or negative-acknowledges the message based on how the run
//! ended.
//!
//! ## Architecture
//!
//! - **messaging**: queue message shapes, the `Puller`/`Publisher` seams over
//!   the queue backend, and the per-message lease sustainer.
//! - **storage**: the object-storage seam used for file staging and the
//!   lock-file deduplication backend.
//! - **variable**: `%{dotted.path}` template expansion over message
//!   attributes and the staged file layout.
//! - **worker**: bounded worker pool draining download/upload targets with
//!   per-target retry.
//! - **job**: the six-phase pipeline (prepare, download, execute, upload,
//!   finalize, cleanup), step/progress state tables, progress notification,
//!   and the deduplication gate.
//! - **subscription** / **process**: the pull loop and the wiring that turns
//!   config plus backend seams into a running worker.
//!
//! All backend access goes through traits, so the pipeline is testable end to
//! end with the in-memory implementations in [`test_helpers`].

pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod messaging;
pub mod process;
pub mod resilience;
pub mod storage;
pub mod subscription;
pub mod test_helpers;
pub mod variable;
pub mod worker;

pub use config::ProcessConfig;
pub use error::{Error, Result, Retryable};
pub use job::{Job, JobStep, JobStepStatus, Progress, ProgressNotification};
pub use messaging::{JobMessage, Publisher, Puller};
pub use process::Process;
pub use storage::Storage;
pub use subscription::JobSubscription;
