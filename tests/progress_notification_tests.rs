//! Progress notification publishing: level filtering against the configured
//! threshold, attribute stamping, and value truncation.

mod common;

use common::{attrs, Harness, PROGRESS_TOPIC};
use stagehand_core::job::{JobStep, JobStepStatus};
use stagehand_core::messaging::PubsubMessage;

const JOB_ID: &str = "job-0001";

struct Expected {
    step: &'static str,
    step_status: &'static str,
    progress: &'static str,
    completed: &'static str,
    level: &'static str,
    data: &'static str,
}

fn assert_published(published: &[(String, PubsubMessage)], expecteds: &[Expected]) {
    assert_eq!(published.len(), expecteds.len());
    for ((topic, message), expected) in published.iter().zip(expecteds) {
        assert_eq!(topic, PROGRESS_TOPIC);
        let data = String::from_utf8(message.decoded_data().unwrap()).unwrap();
        assert_eq!(data, expected.data);

        let a = &message.attributes;
        assert_eq!(a.get("step").unwrap(), expected.step);
        assert_eq!(a.get("step_status").unwrap(), expected.step_status);
        assert_eq!(a.get("progress").unwrap(), expected.progress);
        assert_eq!(a.get("completed").unwrap(), expected.completed);
        assert_eq!(a.get("level").unwrap(), expected.level);
        assert_eq!(a.get("host").unwrap(), "testhost1");
        assert_eq!(a.get("job_message_id").unwrap(), JOB_ID);
        assert_eq!(a.get("msg_id").unwrap(), "1234");
    }
}

#[tokio::test]
async fn info_threshold_publishes_only_notable_transitions() {
    let harness = Harness::new();
    let notification = harness.notification();
    let base = attrs(&[("msg_id", "1234")]);

    for (step, status) in [
        (JobStep::Initializing, JobStepStatus::Starting),
        (JobStep::Initializing, JobStepStatus::Success),
        (JobStep::Downloading, JobStepStatus::Starting),
        (JobStep::Downloading, JobStepStatus::Success),
        (JobStep::Executing, JobStepStatus::Starting),
        (JobStep::Executing, JobStepStatus::Success),
        (JobStep::Uploading, JobStepStatus::Starting),
        (JobStep::Uploading, JobStepStatus::Success),
        (JobStep::Cleanup, JobStepStatus::Starting),
        (JobStep::Cleanup, JobStepStatus::Success),
        (JobStep::AckSending, JobStepStatus::Starting),
        (JobStep::AckSending, JobStepStatus::Success),
    ] {
        notification.notify(JOB_ID, step, status, &base, None).await;
    }

    assert_published(
        &harness.publisher.published(),
        &[
            Expected {
                step: "INITIALIZING",
                step_status: "SUCCESS",
                progress: "1",
                completed: "false",
                level: "info",
                data: "INITIALIZING SUCCESS",
            },
            Expected {
                step: "ACKSENDING",
                step_status: "SUCCESS",
                progress: "5",
                completed: "true",
                level: "info",
                data: "ACKSENDING SUCCESS",
            },
        ],
    );
}

#[tokio::test]
async fn failing_run_publishes_the_failure_and_the_nack() {
    let harness = Harness::new();
    let notification = harness.notification();
    let base = attrs(&[("msg_id", "1234")]);

    for (step, status) in [
        (JobStep::Initializing, JobStepStatus::Starting),
        (JobStep::Initializing, JobStepStatus::Success),
        (JobStep::Downloading, JobStepStatus::Starting),
        (JobStep::Downloading, JobStepStatus::Success),
        (JobStep::Executing, JobStepStatus::Starting),
        (JobStep::Executing, JobStepStatus::Failure),
        (JobStep::Cleanup, JobStepStatus::Starting),
        (JobStep::Cleanup, JobStepStatus::Success),
        (JobStep::NackSending, JobStepStatus::Starting),
        (JobStep::NackSending, JobStepStatus::Success),
    ] {
        notification.notify(JOB_ID, step, status, &base, None).await;
    }

    assert_published(
        &harness.publisher.published(),
        &[
            Expected {
                step: "INITIALIZING",
                step_status: "SUCCESS",
                progress: "1",
                completed: "false",
                level: "info",
                data: "INITIALIZING SUCCESS",
            },
            Expected {
                step: "EXECUTING",
                step_status: "FAILURE",
                progress: "2",
                completed: "false",
                level: "error",
                data: "EXECUTING FAILURE",
            },
            Expected {
                step: "NACKSENDING",
                step_status: "SUCCESS",
                progress: "3",
                completed: "false",
                level: "warning",
                data: "NACKSENDING SUCCESS",
            },
        ],
    );
}

#[tokio::test]
async fn failure_message_overrides_the_default_payload() {
    let harness = Harness::new();
    let notification = harness.notification();

    notification
        .notify(
            JOB_ID,
            JobStep::Executing,
            JobStepStatus::Failure,
            &attrs(&[("msg_id", "1234")]),
            Some("Command failed with 3: boom"),
        )
        .await;

    let published = harness.publisher.published();
    assert_eq!(published.len(), 1);
    let data = String::from_utf8(published[0].1.decoded_data().unwrap()).unwrap();
    assert_eq!(data, "Command failed with 3: boom");
}

#[tokio::test]
async fn attribute_values_are_capped_at_1024_bytes() {
    let harness = Harness::new();
    let notification = harness.notification();
    let oversized = "x".repeat(4000);
    let base = attrs(&[("msg_id", "1234"), ("giant", oversized.as_str())]);

    notification
        .notify(
            JOB_ID,
            JobStep::Initializing,
            JobStepStatus::Success,
            &base,
            None,
        )
        .await;

    let published = harness.publisher.published();
    assert_eq!(published.len(), 1);
    let giant = published[0].1.attributes.get("giant").unwrap();
    assert_eq!(giant.len(), 1024);
}

#[tokio::test]
async fn working_error_reports_are_published_unconditionally() {
    let harness = Harness::new();
    let notification = harness.notification();

    notification
        .notify_working_error(JOB_ID, "Failed to extend ack deadline")
        .await;

    let published = harness.publisher.published();
    assert_eq!(published.len(), 1);
    let a = &published[0].1.attributes;
    assert_eq!(a.get("level").unwrap(), "error");
    assert_eq!(a.get("progress").unwrap(), "2");
    assert_eq!(a.get("completed").unwrap(), "false");
    assert_eq!(a.get("job_message_id").unwrap(), JOB_ID);
    let data = String::from_utf8(published[0].1.decoded_data().unwrap()).unwrap();
    assert_eq!(data, "Failed to extend ack deadline");
}
