//! End-to-end pipeline tests over the in-memory seams: command line
//! construction from message attributes, file staging, execution, upload and
//! the terminal ack/nack decision.

mod common;

use common::{attrs, command, Harness};
use serde_json::json;
use stagehand_core::config::CommandConfig;
use stagehand_core::job::{EXEC_UUID_ATTR, USE_DATA_AS_ATTRIBUTES_ATTR};
use std::collections::HashMap;

#[tokio::test]
async fn download_files_attribute_expands_to_local_paths() {
    let harness = Harness::new();
    let message = harness.message(
        "msg-1",
        b"",
        attrs(&[("download_files", r#"["gs://bucket1/path/to/file1"]"#)]),
    );
    let mut job = harness.job(
        command(&["cmd1", "%{download_files}", "%{workspace}"]),
        message,
    );

    job.prepare().await.unwrap();

    let local = job
        .workspace()
        .join("downloads/bucket1/path/to/file1")
        .to_string_lossy()
        .into_owned();
    assert_eq!(
        job.download_file_map().get("gs://bucket1/path/to/file1"),
        Some(&local)
    );
    assert_eq!(*job.local_download_files(), json!([local]));
    assert_eq!(
        job.argv(),
        [
            "cmd1".to_string(),
            local,
            job.workspace().to_string_lossy().into_owned()
        ]
    );
}

#[tokio::test]
async fn flattened_file_list_becomes_separate_argv_slots() {
    let harness = Harness::new();
    let message = harness.message(
        "msg-2",
        b"",
        attrs(&[(
            "download_files",
            r#"["gs://bucket1/a.txt", "gs://bucket1/b.txt"]"#,
        )]),
    );
    let mut job = harness.job(command(&["cmd1", "%{download_files}"]), message);

    job.prepare().await.unwrap();

    let a = job.workspace().join("downloads/bucket1/a.txt");
    let b = job.workspace().join("downloads/bucket1/b.txt");
    assert_eq!(
        job.argv(),
        [
            "cmd1".to_string(),
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ]
    );
}

#[tokio::test]
async fn nested_array_under_object_key_splits_into_argv_slots() {
    let harness = Harness::new();
    let message = harness.message(
        "msg-13",
        b"",
        attrs(&[(
            "download_files",
            r#"{"foo": "gs://bucket1/f1.txt", "bar": ["gs://bucket1/b1.txt", "gs://bucket1/b2.txt"]}"#,
        )]),
    );
    let mut job = harness.job(
        command(&["cmd1", "%{download_files.foo}", "%{download_files.bar}"]),
        message,
    );

    job.prepare().await.unwrap();

    let f1 = job.workspace().join("downloads/bucket1/f1.txt");
    let b1 = job.workspace().join("downloads/bucket1/b1.txt");
    let b2 = job.workspace().join("downloads/bucket1/b2.txt");
    // The array-valued key expands to one slot per element, not one joined
    // string.
    assert_eq!(
        job.argv(),
        [
            "cmd1".to_string(),
            f1.to_string_lossy().into_owned(),
            b1.to_string_lossy().into_owned(),
            b2.to_string_lossy().into_owned(),
        ]
    );
}

#[tokio::test]
async fn object_notification_attributes_become_download_files() {
    let harness = Harness::new();
    let message = harness.message(
        "msg-3",
        b"",
        attrs(&[
            ("eventType", "OBJECT_FINALIZE"),
            ("bucketId", "bucket1"),
            ("objectId", "path/to/file1"),
        ]),
    );
    let mut job = harness.job(command(&["cmd1", "%{download_files}"]), message);

    job.prepare().await.unwrap();

    assert_eq!(
        *job.remote_download_files(),
        json!(["gs://bucket1/path/to/file1"])
    );
    let local = job.workspace().join("downloads/bucket1/path/to/file1");
    assert_eq!(
        job.argv(),
        ["cmd1".to_string(), local.to_string_lossy().into_owned()]
    );
}

#[tokio::test]
async fn both_download_sources_is_a_configuration_error() {
    let harness = Harness::new();
    let message = harness.message(
        "msg-4",
        b"",
        attrs(&[
            ("download_files", r#"["gs://bucket1/x"]"#),
            ("eventType", "OBJECT_FINALIZE"),
            ("bucketId", "bucket1"),
            ("objectId", "path/to/file1"),
        ]),
    );
    let mut job = harness.job(command(&["cmd1"]), message);

    let err = job.run().await.unwrap_err();
    assert!(err.to_string().contains("download_files"));
    // Permanent failure: the message is acked away, never redelivered.
    assert_eq!(harness.puller.acks().len(), 1);
    assert!(harness.puller.mads().is_empty());
}

#[tokio::test]
async fn options_table_dispatches_on_expanded_template() {
    let harness = Harness::new();

    let mut options = HashMap::new();
    options.insert(
        "archive".to_string(),
        vec!["tar".to_string(), "czf".to_string(), "%{attrs.out}".to_string()],
    );
    options.insert(
        "default".to_string(),
        vec!["cmd1".to_string(), "fallback".to_string()],
    );
    let config = CommandConfig {
        template: vec!["%{attrs.mode}".to_string()],
        options,
        dryrun: false,
    };

    // Known key selects its entry, expanded in a second pass.
    let message = harness.message("msg-5", b"", attrs(&[("mode", "archive"), ("out", "o.tgz")]));
    let mut job = harness.job(config.clone(), message);
    job.prepare().await.unwrap();
    assert_eq!(job.argv(), ["tar", "czf", "o.tgz"]);

    // Missing selector attribute falls back to the default entry.
    let message = harness.message("msg-6", b"", HashMap::new());
    let mut job = harness.job(config.clone(), message);
    job.prepare().await.unwrap();
    assert_eq!(job.argv(), ["cmd1", "fallback"]);

    // A key that resolves but matches nothing is rejected.
    let message = harness.message("msg-7", b"", attrs(&[("mode", "unknown-mode")]));
    let mut job = harness.job(config, message);
    let err = job.prepare().await.unwrap_err();
    assert!(err
        .to_string()
        .contains("invalid command options key \"unknown-mode\""));
}

#[tokio::test]
async fn payload_promotion_merges_json_object_into_attributes() {
    let harness = Harness::new();
    let message = harness.message(
        "msg-8",
        br#"{"arg": "val1", "count": 3}"#,
        attrs(&[(USE_DATA_AS_ATTRIBUTES_ATTR, "true")]),
    );
    let mut job = harness.job(command(&["cmd1", "%{attrs.arg}", "%{attrs.count}"]), message);

    job.prepare().await.unwrap();

    assert_eq!(job.argv(), ["cmd1", "val1", "3"]);
    assert!(job.message().attr(EXEC_UUID_ATTR).is_some());
}

#[tokio::test]
async fn full_pipeline_downloads_executes_and_uploads() {
    let harness = Harness::new();
    harness
        .storage
        .put_object("bucket1", "in/data.txt", b"payload-bytes");

    let message = harness.message(
        "msg-9",
        b"",
        attrs(&[("download_files", r#"["gs://bucket1/in/data.txt"]"#)]),
    );
    let mut job = harness.job(
        command(&[
            "sh",
            "-c",
            "mkdir -p %{uploads_dir}/bucket2/out && cp %{download_files} %{uploads_dir}/bucket2/out/copy.txt",
        ]),
        message,
    );

    job.run().await.unwrap();

    assert_eq!(
        harness.storage.object("bucket2", "out/copy.txt").unwrap(),
        b"payload-bytes"
    );
    assert_eq!(harness.puller.acks().len(), 1);
    assert!(harness.puller.mads().is_empty());

    // The workspace is gone.
    let leftovers: Vec<_> = std::fs::read_dir(harness.workspace_root())
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());

    // Info threshold publishes the initializing and final ack successes.
    let published = harness.publisher.published();
    assert_eq!(published.len(), 2);
}

#[tokio::test]
async fn dryrun_skips_execution_and_acks() {
    let harness = Harness::new();
    let message = harness.message("msg-10", b"", HashMap::new());
    let mut config = command(&["definitely-not-an-installed-binary"]);
    config.dryrun = true;
    let mut job = harness.job(config, message);

    job.run().await.unwrap();
    assert_eq!(harness.puller.acks().len(), 1);
}

#[tokio::test]
async fn nonzero_exit_cancels_without_uploading() {
    let harness = Harness::new();
    let message = harness.message("msg-11", b"", HashMap::new());
    let mut job = harness.job(
        command(&["sh", "-c", "echo boom >&2; exit 3"]),
        message,
    );

    let err = job.run().await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains('3'), "unexpected error: {text}");
    assert!(text.contains("boom"), "unexpected error: {text}");

    // Deterministic failure: acked and dropped, nothing uploaded.
    assert_eq!(harness.puller.acks().len(), 1);
    assert!(harness.puller.mads().is_empty());
    assert_eq!(harness.storage.object_count(), 0);
}

#[tokio::test]
async fn download_failure_nacks_for_redelivery() {
    let harness = Harness::new();
    harness.storage.put_object("bucket1", "in/data.txt", b"x");
    harness
        .storage
        .fail_downloads
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let message = harness.message(
        "msg-12",
        b"",
        attrs(&[("download_files", r#"["gs://bucket1/in/data.txt"]"#)]),
    );
    let mut job = harness.job(command(&["sh", "-c", "true"]), message);

    let err = job.run().await.unwrap_err();
    assert!(err.to_string().contains("injected failure"));

    // Transient failure: nacked (deadline reset to zero), never acked.
    assert!(harness.puller.acks().is_empty());
    let mads = harness.puller.mads();
    assert_eq!(mads.len(), 1);
    assert_eq!(mads[0].2, 0);
    assert_eq!(mads[0].1, vec!["ack-msg-12".to_string()]);
}

#[tokio::test]
async fn message_without_id_is_invalid() {
    let harness = Harness::new();
    let message = harness.message("", b"", HashMap::new());
    let mut job = harness.job(command(&["cmd1"]), message);

    let err = job.prepare().await.unwrap_err();
    assert!(err.to_string().contains("no message id is given"));
}
