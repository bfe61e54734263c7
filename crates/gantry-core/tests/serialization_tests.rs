//! Wire-shape tests for gantry-core types that are persisted as JSON.

use gantry_core::ids::*;
use gantry_core::preexec::{EnglishCatalog, PreExecutionError, PreExecutionErrorCode};
use gantry_core::run::{ConcurrencyType, Run, TriggerEvent};
use gantry_core::Status;
use serde_json::json;

#[test]
fn test_pre_execution_error_json_shape() {
    let error = PreExecutionError::new(
        PreExecutionErrorCode::PersistentIncompleteMatrix,
        ["build", "setup, lint"],
    );

    let value = serde_json::to_value(&error).expect("serialize");
    assert_eq!(value, json!({ "code": 3, "args": ["build", "setup, lint"] }));
}

#[test]
fn test_pre_execution_error_from_newer_release_still_renders() {
    let stored = json!({ "code": 99, "args": ["x"] });
    let error: PreExecutionError = serde_json::from_value(stored).expect("deserialize");

    assert_eq!(error.code(), None);
    assert!(error.render(&EnglishCatalog).starts_with("<unsupported error: code=99"));
}

#[test]
fn test_run_serializes_status_and_ids() {
    let run = Run {
        id: RunId::new(12),
        repo_id: RepoId::new(3),
        event: TriggerEvent::PullRequestSync,
        status: Status::Blocked,
        concurrency_type: ConcurrencyType::QueueBehind,
        ..Default::default()
    };

    let value = serde_json::to_value(&run).expect("serialize");
    assert_eq!(value["id"], json!(12));
    assert_eq!(value["repo_id"], json!(3));
    assert_eq!(value["status"], json!("blocked"));
    assert_eq!(value["event"], json!("pull_request_sync"));
    assert_eq!(value["concurrency_type"], json!("queue_behind"));

    let parsed: Run = serde_json::from_value(value).expect("deserialize");
    assert_eq!(parsed, run);
}
