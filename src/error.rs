//! # Structured Error Handling
//!
//! Crate-wide error type with a retryable/permanent classification that drives
//! the ack-vs-nack decision at the end of every job: transient transfer and
//! queue failures trigger a negative-acknowledge (redelivery), while invalid
//! job input and configuration mistakes are acknowledged and dropped so they
//! cannot loop forever.

use crate::storage::StorageError;
use crate::variable::VariableError;
use thiserror::Error;

/// Classification consumed by [`crate::resilience::RetryPolicy`] and the job
/// finalizer. Permanent errors short-circuit retry loops.
pub trait Retryable {
    fn retryable(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum Error {
    /// The job message itself is unusable (missing id, malformed download
    /// specification). Never retried.
    #[error("Invalid job: {message}")]
    InvalidJob { message: String },

    /// A configuration value is missing or inconsistent. Never retried.
    #[error("Configuration error: {key}: {message}")]
    Configuration { key: String, message: String },

    /// Command template expansion failed. Carries every invalid reference
    /// found in the template, not just the first.
    #[error(transparent)]
    Variable(#[from] VariableError),

    /// One or more file transfers failed after exhausting retries. The
    /// message is the newline-joined list of per-target failures.
    #[error("{message}")]
    Transfer { message: String },

    /// A queue backend call (pull, ack, modify-ack-deadline) failed. Fatal
    /// to the current job attempt and, from the subscription loop's point of
    /// view, fatal to the loop.
    #[error("Queue error: {operation}: {message}")]
    Queue { operation: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The job command exited non-zero. Treated as permanent: the same
    /// command on the same inputs is assumed to fail the same way.
    #[error("Command failed with {status}: {output}")]
    CommandFailed { status: String, output: String },

    /// Deduplication gate failure (embedded store unavailable, etc).
    #[error("Job check error: {message}")]
    Check { message: String },

    /// Another process holds the lock file for this job id and it has not
    /// gone stale yet.
    #[error("Job lock {bucket}/{object} is held by another process")]
    Locked { bucket: String, object: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Aggregate of independent failures from one phase, reported together.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))]
    Composite(Vec<Error>),
}

impl Retryable for Error {
    fn retryable(&self) -> bool {
        match self {
            Error::InvalidJob { .. }
            | Error::Configuration { .. }
            | Error::Variable(_)
            | Error::CommandFailed { .. }
            | Error::Check { .. } => false,
            Error::Transfer { .. }
            | Error::Queue { .. }
            | Error::Locked { .. }
            | Error::Io(_) => true,
            Error::Storage(e) => e.retryable(),
            // A composite is only safe to redeliver when every member is.
            Error::Composite(errors) => errors.iter().all(Retryable::retryable),
        }
    }
}

impl Error {
    pub fn invalid_job(message: impl Into<String>) -> Self {
        Error::InvalidJob {
            message: message.into(),
        }
    }

    pub fn configuration(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn queue(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Queue {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_job_is_permanent() {
        assert!(!Error::invalid_job("no message id").retryable());
        assert!(!Error::configuration("command", "empty template").retryable());
    }

    #[test]
    fn transfer_is_retryable() {
        let err = Error::Transfer {
            message: "download failed".into(),
        };
        assert!(err.retryable());
    }

    #[test]
    fn composite_retryable_only_when_all_members_are() {
        let all_transient = Error::Composite(vec![
            Error::Transfer {
                message: "a".into(),
            },
            Error::Transfer {
                message: "b".into(),
            },
        ]);
        assert!(all_transient.retryable());

        let mixed = Error::Composite(vec![
            Error::Transfer {
                message: "a".into(),
            },
            Error::invalid_job("bad message"),
        ]);
        assert!(!mixed.retryable());
    }

    #[test]
    fn composite_message_joins_members_with_newlines() {
        let err = Error::Composite(vec![
            Error::invalid_job("first"),
            Error::invalid_job("second"),
        ]);
        assert_eq!(err.to_string(), "Invalid job: first\nInvalid job: second");
    }
}
