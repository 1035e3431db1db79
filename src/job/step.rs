//! # Pipeline Step Definitions
//!
//! Static tables mapping each pipeline step to its log levels and coarse
//! progress code. Primary steps report their base progress regardless of
//! outcome; terminal steps (nack/cancel/ack) only report their base progress
//! on success, since until the queue call lands the job is still just
//! working.

use std::fmt;
use tracing::Level;

/// Coarse progress codes published to the progress topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Progress {
    Preparing = 1,
    Working = 2,
    Retrying = 3,
    InvalidJob = 4,
    Completed = 5,
}

impl Progress {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Outcome being reported for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStepStatus {
    Starting,
    Success,
    Failure,
}

impl fmt::Display for JobStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStepStatus::Starting => "STARTING",
            JobStepStatus::Success => "SUCCESS",
            JobStepStatus::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// One phase of the job pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
    Initializing,
    Downloading,
    Executing,
    Uploading,
    Cleanup,
    NackSending,
    Cancelling,
    AckSending,
}

struct StepDef {
    name: &'static str,
    success_level: Level,
    failure_level: Level,
    base_progress: Progress,
}

impl JobStep {
    const fn def(self) -> StepDef {
        match self {
            JobStep::Initializing => StepDef {
                name: "INITIALIZING",
                success_level: Level::INFO,
                failure_level: Level::ERROR,
                base_progress: Progress::Preparing,
            },
            JobStep::Downloading => StepDef {
                name: "DOWNLOADING",
                success_level: Level::DEBUG,
                failure_level: Level::ERROR,
                base_progress: Progress::Working,
            },
            JobStep::Executing => StepDef {
                name: "EXECUTING",
                success_level: Level::DEBUG,
                failure_level: Level::ERROR,
                base_progress: Progress::Working,
            },
            JobStep::Uploading => StepDef {
                name: "UPLOADING",
                success_level: Level::DEBUG,
                failure_level: Level::ERROR,
                base_progress: Progress::Working,
            },
            JobStep::Cleanup => StepDef {
                name: "CLEANUP",
                success_level: Level::DEBUG,
                failure_level: Level::WARN,
                base_progress: Progress::Working,
            },
            JobStep::NackSending => StepDef {
                name: "NACKSENDING",
                success_level: Level::WARN,
                failure_level: Level::ERROR,
                base_progress: Progress::Retrying,
            },
            JobStep::Cancelling => StepDef {
                name: "CANCELLING",
                success_level: Level::ERROR,
                failure_level: Level::ERROR,
                base_progress: Progress::InvalidJob,
            },
            JobStep::AckSending => StepDef {
                name: "ACKSENDING",
                success_level: Level::INFO,
                failure_level: Level::ERROR,
                base_progress: Progress::Completed,
            },
        }
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStep::NackSending | JobStep::Cancelling | JobStep::AckSending
        )
    }

    /// Level the notification for this step/status pair is reported at.
    /// Starting is always debug noise.
    pub fn log_level_for(self, status: JobStepStatus) -> Level {
        match status {
            JobStepStatus::Starting => Level::DEBUG,
            JobStepStatus::Success => self.def().success_level,
            JobStepStatus::Failure => self.def().failure_level,
        }
    }

    /// Progress code for this step/status pair. Terminal steps stay at
    /// `Working` until their queue call actually succeeds.
    pub fn progress_for(self, status: JobStepStatus) -> Progress {
        if self.is_terminal() && status != JobStepStatus::Success {
            Progress::Working
        } else {
            self.def().base_progress
        }
    }

    /// Only a successful final acknowledgement completes the job.
    pub fn completed(self, status: JobStepStatus) -> bool {
        self == JobStep::AckSending && status == JobStepStatus::Success
    }
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
