//! Event Store Integration Tests
//!
//! Tests for the JSONL log format, append order and snapshots.

use pipewright::core::EventStore;
use pipewright::domain::events::{PipelinePlan, PipelineQueued, PipelineStarted};
use pipewright::domain::{Envelope, LogEntry, PipelineStatus};
use serde_json::{Map, Value};
use tempfile::TempDir;

const EXEC: &str = "exec_store";

fn queued() -> Envelope {
    Envelope::event(
        EXEC,
        PipelineQueued {
            pipeline_execution_id: "pexec_1".to_string(),
            name: "demo".to_string(),
            args: Map::new(),
            parent_execution_id: None,
            parent_step_execution_id: None,
        },
    )
}

fn started() -> Envelope {
    Envelope::event(
        EXEC,
        PipelineStarted {
            pipeline_execution_id: "pexec_1".to_string(),
        },
    )
}

fn plan() -> Envelope {
    Envelope::command(
        EXEC,
        PipelinePlan {
            pipeline_execution_id: "pexec_1".to_string(),
        },
    )
}

#[tokio::test]
async fn test_log_line_format() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path());
    store.append_batch(EXEC, &[queued(), plan()]).await.unwrap();

    let content = std::fs::read_to_string(store.log_path(EXEC)).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["execution_id"], EXEC);
    assert_eq!(first["sequence"], 1);
    assert_eq!(first["type"], "event.pipeline_queued");
    assert_eq!(first["payload"]["pipeline_execution_id"], "pexec_1");
    assert!(first["created_at"].as_str().unwrap().contains('T'));

    let second: LogEntry = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second.fact_type, "command.pipeline_plan");
    assert_eq!(second.sequence, 2);
}

#[tokio::test]
async fn test_sequences_follow_append_order() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path());

    store.append_batch(EXEC, &[queued()]).await.unwrap();
    store.append_batch(EXEC, &[started(), plan()]).await.unwrap();
    store.append_batch(EXEC, &[]).await.unwrap();
    store.append_batch(EXEC, &[plan()]).await.unwrap();

    let entries = store.replay(EXEC).await.unwrap();
    let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    let types: Vec<&str> = entries.iter().map(|e| e.fact_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "event.pipeline_queued",
            "event.pipeline_started",
            "command.pipeline_plan",
            "command.pipeline_plan"
        ]
    );
}

#[tokio::test]
async fn test_load_rebuilds_aggregate() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path());
    store.append_batch(EXEC, &[queued(), started()]).await.unwrap();

    let execution = store.load(EXEC).await.unwrap();
    let root = execution.root().unwrap();
    assert_eq!(root.id, "pexec_1");
    assert_eq!(root.status, PipelineStatus::Started);
}

#[tokio::test]
async fn test_snapshot_is_written_next_to_log() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path());
    store.append_batch(EXEC, &[queued(), started()]).await.unwrap();
    assert!(store.read_snapshot(EXEC).await.unwrap().is_none());

    let execution = store.load(EXEC).await.unwrap();
    let path = store.write_snapshot(&execution).await.unwrap();

    assert_eq!(path, temp.path().join(EXEC).join("snapshot.json"));
    let json: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["id"], EXEC);
    assert_eq!(json["pipeline_executions"]["pexec_1"]["status"], "started");

    assert_eq!(store.read_snapshot(EXEC).await.unwrap(), Some(execution));
}

#[tokio::test]
async fn test_list_only_includes_logged_executions() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path());
    assert!(store.list_executions().await.unwrap().is_empty());

    store.append_batch(EXEC, &[queued()]).await.unwrap();
    std::fs::create_dir_all(temp.path().join("exec_empty")).unwrap();

    assert_eq!(store.list_executions().await.unwrap(), vec![EXEC.to_string()]);
}
