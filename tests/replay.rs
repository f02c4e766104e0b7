//! Replay Integration Tests
//!
//! Rebuilding an execution from its log: determinism, monotonic step
//! sets, unknown and malformed facts, and error deduplication.

use chrono::Utc;
use pipewright::domain::events::*;
use pipewright::domain::{
    Envelope, Event, Execution, ExecutionError, LogEntry, Message, PipelineStatus, StepError, StepOutput, StepRetry,
};
use serde_json::{json, Map};

const EXEC: &str = "exec_replay";

fn entries(messages: Vec<Message>) -> Vec<LogEntry> {
    messages
        .into_iter()
        .enumerate()
        .map(|(i, message)| LogEntry::from_envelope(&Envelope::new(EXEC, message), i as u64 + 1).unwrap())
        .collect()
}

fn queued(pe: &str) -> Message {
    Event::from(PipelineQueued {
        pipeline_execution_id: pe.to_string(),
        name: "demo".to_string(),
        args: Map::new(),
        parent_execution_id: None,
        parent_step_execution_id: None,
    })
    .into()
}

fn started(pe: &str) -> Message {
    Event::from(PipelineStarted {
        pipeline_execution_id: pe.to_string(),
    })
    .into()
}

fn planned(pe: &str, steps: &[&str]) -> Message {
    Event::from(PipelinePlanned {
        pipeline_execution_id: pe.to_string(),
        next_steps: steps.iter().map(|s| s.to_string()).collect(),
    })
    .into()
}

fn step_queue(pe: &str, se: &str, name: &str, retry: Option<StepRetry>) -> Message {
    Command::from(StepQueue {
        pipeline_execution_id: pe.to_string(),
        step_execution_id: se.to_string(),
        step_name: name.to_string(),
        step_input: Map::new(),
        step_for_each: None,
        step_loop: None,
        step_retry: retry,
        delay_ms: 0,
    })
    .into()
}

fn step_start(pe: &str, se: &str, name: &str) -> Message {
    Command::from(StepStart {
        pipeline_execution_id: pe.to_string(),
        step_execution_id: se.to_string(),
        step_name: name.to_string(),
        step_input: Map::new(),
        step_for_each: None,
        step_loop: None,
        step_retry: None,
        delay_ms: 0,
    })
    .into()
}

fn step_finished(pe: &str, se: &str, output: StepOutput, retry: Option<StepRetry>) -> Message {
    Event::from(StepFinished {
        pipeline_execution_id: pe.to_string(),
        step_execution_id: se.to_string(),
        step_for_each: None,
        step_loop: None,
        step_retry: retry,
        output: Some(output),
        step_output: Map::new(),
    })
    .into()
}

fn error(id: &str) -> StepError {
    StepError {
        instance_id: id.to_string(),
        message: format!("boom {}", id),
        error_code: "execution".to_string(),
    }
}

fn happy_log() -> Vec<LogEntry> {
    let mut vars = Map::new();
    vars.insert("answer".to_string(), json!(42));

    entries(vec![
        queued("p1"),
        started("p1"),
        planned("p1", &["a"]),
        step_queue("p1", "s1", "a", None),
        step_start("p1", "s1", "a"),
        step_finished("p1", "s1", StepOutput::finished(vars), None),
        Command::from(PipelineFinish {
            pipeline_execution_id: "p1".to_string(),
        })
        .into(),
    ])
}

#[test]
fn test_replay_is_deterministic() {
    let log = happy_log();

    let first = Execution::from_log(EXEC, &log).unwrap();
    let second = Execution::from_log(EXEC, &log).unwrap();
    assert_eq!(first, second);

    let pe = first.pipeline_execution("p1").unwrap();
    assert_eq!(pe.status, PipelineStatus::Finishing);
    assert!(pe.is_step_complete("a"));
    assert_eq!(first.pipeline_step_outputs("p1").unwrap()["a"], json!({"answer": 42}));
}

#[test]
fn test_replay_prefix_matches_incremental_apply() {
    let log = happy_log();

    let mut incremental = Execution::new(EXEC);
    for entry in &log {
        incremental = incremental.apply_entry(entry).unwrap();
    }
    assert_eq!(incremental, Execution::from_log(EXEC, &log).unwrap());
}

#[test]
fn test_finished_ids_are_never_requeued() {
    let mut messages = vec![
        queued("p1"),
        started("p1"),
        planned("p1", &["a"]),
        step_queue("p1", "s1", "a", None),
        step_start("p1", "s1", "a"),
        step_finished("p1", "s1", StepOutput::finished(Map::new()), None),
    ];
    // Late duplicates of earlier facts
    messages.push(step_queue("p1", "s1", "a", None));
    messages.push(step_start("p1", "s1", "a"));
    messages.push(step_finished("p1", "s1", StepOutput::failed(vec![error("late")]), None));

    let ex = Execution::from_log(EXEC, &entries(messages)).unwrap();
    let pe = ex.pipeline_execution("p1").unwrap();
    let status = &pe.step_status["a"]["0"];

    assert!(status.finished.contains("s1"));
    assert!(status.queued.is_empty());
    assert!(status.started.is_empty());
    assert!(status.failed.is_empty());
    assert_eq!(status.step_executions.len(), 1);
    assert!(pe.errors.is_empty());
}

#[test]
fn test_unknown_fact_types_are_skipped() {
    let mut log = happy_log();
    let unknown = LogEntry {
        execution_id: EXEC.to_string(),
        sequence: 99,
        fact_type: "event.something_from_the_future".to_string(),
        created_at: Utc::now(),
        payload: json!({"pipeline_execution_id": "p1", "whatever": true}),
    };
    log.insert(3, unknown);

    let with_unknown = Execution::from_log(EXEC, &log).unwrap();
    let without = Execution::from_log(EXEC, &happy_log()).unwrap();
    assert_eq!(
        with_unknown.pipeline_execution("p1").unwrap().status,
        without.pipeline_execution("p1").unwrap().status
    );
}

#[test]
fn test_malformed_payload_is_fatal() {
    let mut log = happy_log();
    log.push(LogEntry {
        execution_id: EXEC.to_string(),
        sequence: 8,
        fact_type: "event.pipeline_queued".to_string(),
        created_at: Utc::now(),
        payload: json!({"unexpected": 1}),
    });

    match Execution::from_log(EXEC, &log) {
        Err(ExecutionError::MalformedPayload { fact_type, sequence, .. }) => {
            assert_eq!(fact_type, "event.pipeline_queued");
            assert_eq!(sequence, 8);
        }
        other => panic!("expected malformed payload error, got {:?}", other),
    }
}

#[test]
fn test_foreign_execution_id_is_rejected() {
    let mut log = happy_log();
    log[1].execution_id = "exec_other".to_string();
    assert!(matches!(
        Execution::from_log(EXEC, &log),
        Err(ExecutionError::ExecutionIdMismatch { .. })
    ));
}

#[test]
fn test_errors_are_deduplicated_across_facts() {
    let shared = error("e1");
    let log = entries(vec![
        queued("p1"),
        started("p1"),
        planned("p1", &["a", "b"]),
        step_queue("p1", "s1", "a", None),
        step_queue("p1", "s2", "b", None),
        step_finished("p1", "s1", StepOutput::failed(vec![shared.clone()]), None),
        step_finished("p1", "s2", StepOutput::failed(vec![shared.clone(), error("e2")]), None),
        Event::from(PipelineFailed {
            pipeline_execution_id: "p1".to_string(),
            errors: vec![shared.clone(), error("e2")],
            pipeline_output: None,
        })
        .into(),
    ]);

    let ex = Execution::from_log(EXEC, &log).unwrap();
    let pe = ex.pipeline_execution("p1").unwrap();
    let ids: Vec<&str> = pe.errors.iter().map(|e| e.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["e1", "e2"]);
    assert_eq!(pe.status, PipelineStatus::Failed);

    let output = pe.pipeline_output.as_ref().unwrap();
    assert_eq!(output["errors"].as_array().unwrap().len(), 2);
}

#[test]
fn test_retry_hold_defers_failure() {
    let held = Some(StepRetry {
        attempt: 1,
        retry_completed: false,
    });
    let log = entries(vec![
        queued("p1"),
        started("p1"),
        planned("p1", &["a"]),
        step_queue("p1", "s1", "a", held),
        step_finished("p1", "s1", StepOutput::failed(vec![error("first")]), held),
    ]);

    let ex = Execution::from_log(EXEC, &log).unwrap();
    let pe = ex.pipeline_execution("p1").unwrap();
    let status = &pe.step_status["a"]["0"];

    assert!(status.error_hold);
    assert!(status.failed.is_empty());
    assert_eq!(status.progress(), 0);
    assert!(!pe.has_failures());
}

#[test]
fn test_terminal_status_is_final() {
    let log = entries(vec![
        queued("p1"),
        started("p1"),
        Event::from(PipelineCanceled {
            pipeline_execution_id: "p1".to_string(),
            reason: None,
        })
        .into(),
        Event::from(PipelineResumed {
            pipeline_execution_id: "p1".to_string(),
        })
        .into(),
        Event::from(PipelineFinished {
            pipeline_execution_id: "p1".to_string(),
            pipeline_output: Map::new(),
        })
        .into(),
    ]);

    let ex = Execution::from_log(EXEC, &log).unwrap();
    let pe = ex.pipeline_execution("p1").unwrap();
    assert_eq!(pe.status, PipelineStatus::Canceled);
    assert!(pe.pipeline_output.is_none());
    assert!(ex.is_complete());
}
