//! Step executions and per-(step, for-each key) status tracking.
//!
//! A `StepStatus` holds four id sets (queued, started, finished, failed).
//! Membership in `finished`/`failed` is final: nothing ever removes an id
//! from those sets or moves it back to `queued`/`started`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{FailureMode, StepError};

/// Input map handed to a step runner
pub type StepInput = Map<String, Value>;

/// For-each key used by steps that do not fan out
pub const DEFAULT_FOR_EACH_KEY: &str = "0";

/// One fan-out iteration of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepForEach {
    /// Stable iteration key (list index or map key)
    pub key: String,

    /// The item being iterated over
    #[serde(default)]
    pub value: Value,
}

impl StepForEach {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Loop bookkeeping for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLoop {
    /// Zero-based loop iteration this attempt ran as
    pub iteration: u32,

    /// False while the step will re-queue itself for another iteration
    pub loop_completed: bool,
}

/// Retry bookkeeping for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRetry {
    /// One-based attempt number
    pub attempt: u32,

    /// False while the step will be attempted again
    pub retry_completed: bool,
}

/// Lifecycle of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    #[default]
    Queued,
    Started,
    Finished,
    Failed,
}

/// What a step runner reports back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepOutput {
    /// `finished` or `failed`
    pub status: StepExecutionStatus,

    /// Named output variables
    #[serde(default)]
    pub output_variables: Map<String, Value>,

    /// Errors reported by the runner
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepError>,

    /// How the errors (if any) affect the pipeline
    #[serde(default)]
    pub failure_mode: FailureMode,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepOutput {
    /// A successful output carrying the given variables
    pub fn finished(output_variables: Map<String, Value>) -> Self {
        Self {
            status: StepExecutionStatus::Finished,
            output_variables,
            ..Default::default()
        }
    }

    /// A failed output carrying the given errors
    pub fn failed(errors: Vec<StepError>) -> Self {
        Self {
            status: StepExecutionStatus::Failed,
            errors,
            ..Default::default()
        }
    }

    pub fn with_times(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.finished_at = Some(finished_at);
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Look up an output variable
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.output_variables.get(name)
    }
}

/// One concrete attempt of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: String,
    pub pipeline_execution_id: String,

    /// Step name within the pipeline definition
    pub name: String,

    pub status: StepExecutionStatus,

    #[serde(default)]
    pub input: StepInput,

    pub step_for_each: Option<StepForEach>,
    pub step_loop: Option<StepLoop>,
    pub step_retry: Option<StepRetry>,

    pub output: Option<StepOutput>,

    /// Named sub-outputs declared on the step
    #[serde(default)]
    pub step_output: Map<String, Value>,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(id: String, pipeline_execution_id: String, name: String) -> Self {
        Self {
            id,
            pipeline_execution_id,
            name,
            status: StepExecutionStatus::Queued,
            input: StepInput::new(),
            step_for_each: None,
            step_loop: None,
            step_retry: None,
            output: None,
            step_output: Map::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// The for-each key this attempt belongs to
    pub fn for_each_key(&self) -> &str {
        self.step_for_each
            .as_ref()
            .map(|f| f.key.as_str())
            .unwrap_or(DEFAULT_FOR_EACH_KEY)
    }
}

/// Summary state for a for-each step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    /// The for-each expression resolved to nothing
    EmptyForEach,

    /// The for-each expansion is fully planned
    CompleteOrFail,
}

/// Progress of one step definition at one for-each key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepStatus {
    /// Planned but no attempt queued yet
    pub initializing: bool,

    pub queued: BTreeSet<String>,
    pub started: BTreeSet<String>,
    pub finished: BTreeSet<String>,
    pub failed: BTreeSet<String>,

    pub overall_state: Option<OverallState>,

    /// The last finished attempt will re-queue itself for another iteration
    pub loop_hold: bool,

    /// The last finished attempt will be retried
    pub error_hold: bool,

    /// Append-only history of finished attempts
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
}

impl StepStatus {
    /// Status for a planned for-each iteration that has nothing queued yet
    pub fn initializing() -> Self {
        Self {
            initializing: true,
            ..Default::default()
        }
    }

    /// Status recording that a for-each expansion produced no items
    pub fn empty_for_each() -> Self {
        Self {
            overall_state: Some(OverallState::EmptyForEach),
            ..Default::default()
        }
    }

    /// True once the id sits in `finished` or `failed`
    pub fn is_terminal(&self, step_execution_id: &str) -> bool {
        self.finished.contains(step_execution_id) || self.failed.contains(step_execution_id)
    }

    /// Record a queued attempt. Returns false when the id is already terminal.
    pub fn queue(&mut self, step_execution_id: &str) -> bool {
        if self.is_terminal(step_execution_id) {
            return false;
        }
        self.initializing = false;
        self.queued.insert(step_execution_id.to_string());
        true
    }

    /// Record a started attempt. Returns false when the id is already terminal.
    pub fn start(&mut self, step_execution_id: &str) -> bool {
        if self.is_terminal(step_execution_id) {
            return false;
        }
        self.initializing = false;
        self.queued.remove(step_execution_id);
        self.started.insert(step_execution_id.to_string());
        true
    }

    /// Record a successful (or failure-ignored) attempt.
    ///
    /// While either hold is set the id leaves the in-flight sets without
    /// entering `finished`.
    pub fn finish(&mut self, step_execution_id: &str, loop_hold: bool, error_hold: bool) -> bool {
        self.settle(step_execution_id, loop_hold, error_hold, false)
    }

    /// Record a failed attempt; same hold rules as [`StepStatus::finish`].
    pub fn fail(&mut self, step_execution_id: &str, loop_hold: bool, error_hold: bool) -> bool {
        self.settle(step_execution_id, loop_hold, error_hold, true)
    }

    fn settle(&mut self, step_execution_id: &str, loop_hold: bool, error_hold: bool, failed: bool) -> bool {
        if self.is_terminal(step_execution_id) {
            return false;
        }
        self.initializing = false;
        self.queued.remove(step_execution_id);
        self.started.remove(step_execution_id);
        self.loop_hold = loop_hold;
        self.error_hold = error_hold;

        if loop_hold || error_hold {
            return true;
        }
        if failed {
            self.failed.insert(step_execution_id.to_string());
        } else {
            self.finished.insert(step_execution_id.to_string());
        }
        true
    }

    /// Percentage of known attempts that reached a terminal set
    pub fn progress(&self) -> u8 {
        if self.overall_state == Some(OverallState::EmptyForEach) {
            return 100;
        }
        if self.initializing || self.loop_hold || self.error_hold {
            return 0;
        }

        let done = self.finished.len() + self.failed.len();
        let total = done + self.queued.len() + self.started.len();
        if total == 0 {
            return 0;
        }
        ((done * 100) / total) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.progress() == 100
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}
