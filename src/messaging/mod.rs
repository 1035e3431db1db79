//! # Messaging Module
//!
//! Queue-facing surface of the job runner: the wire message shapes, the
//! `Puller` and `Publisher` capability traits with their backoff-wrapping
//! decorators, and the `JobMessage` wrapper that owns one delivered message's
//! lease for the duration of a job.

pub mod job_message;
pub mod message;
pub mod publisher;
pub mod puller;

pub use job_message::{JobMessage, JobStatus, SustainerConfig};
pub use message::{PubsubMessage, ReceivedMessage, SubscriptionInfo};
pub use publisher::{BackoffPublisher, Publisher};
pub use puller::{BackoffPuller, Puller};
