//! Execution aggregate and its reconstruction from the fact log.
//!
//! An `Execution` holds every pipeline execution (root and nested) that was
//! triggered by one external stimulus. It is rebuilt by folding the log in
//! sequence order; each fact variant has exactly one transition function.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::errors::{merge_errors, FailureMode, StepError};
use super::events::*;
use super::step::{StepExecution, StepExecutionStatus, StepStatus};

/// Errors raised while reconstructing or querying an execution
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Pipeline execution not found: {0}")]
    PipelineExecutionNotFound(String),

    #[error("Step execution {step_execution_id} not found in pipeline execution {pipeline_execution_id}")]
    StepExecutionNotFound {
        pipeline_execution_id: String,
        step_execution_id: String,
    },

    #[error("Parent step execution {step_execution_id} not found in pipeline execution {pipeline_execution_id}")]
    ParentStepExecutionNotFound {
        pipeline_execution_id: String,
        step_execution_id: String,
    },

    #[error("Malformed {fact_type} payload at sequence {sequence}: {source}")]
    MalformedPayload {
        fact_type: String,
        sequence: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("Log entry belongs to execution {found}, expected {expected}")]
    ExecutionIdMismatch { expected: String, found: String },
}

/// Lifecycle of a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Queued,
    Started,
    Finishing,
    Finished,
    Failed,
    Paused,
    Canceled,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Started | Self::Paused => 1,
            Self::Finishing => 2,
            Self::Finished | Self::Failed | Self::Canceled => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    ///
    /// Forward-only, except that a paused pipeline may be resumed and any
    /// non-terminal pipeline may be canceled or failed.
    pub fn can_transition_to(self, next: PipelineStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        match (self, next) {
            (_, Self::Canceled) | (_, Self::Failed) => true,
            (Self::Paused, Self::Started) => true,
            (Self::Paused, _) => false,
            (Self::Queued | Self::Started, Self::Paused) => true,
            (_, Self::Paused) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// One run of one pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: String,

    /// Pipeline definition name
    pub name: String,

    #[serde(default)]
    pub args: Map<String, Value>,

    pub status: PipelineStatus,

    /// Parent pipeline execution (child pipelines only)
    pub parent_execution_id: Option<String>,

    /// Parent step execution that launched this pipeline
    pub parent_step_execution_id: Option<String>,

    /// step name -> for-each key -> status
    #[serde(default)]
    pub step_status: BTreeMap<String, BTreeMap<String, StepStatus>>,

    #[serde(default)]
    pub step_executions: BTreeMap<String, StepExecution>,

    /// Deduplicated step errors in first-seen order
    #[serde(default)]
    pub errors: Vec<StepError>,

    pub pipeline_output: Option<Map<String, Value>>,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl PipelineExecution {
    fn from_queued(e: &PipelineQueued) -> Self {
        Self {
            id: e.pipeline_execution_id.clone(),
            name: e.name.clone(),
            args: e.args.clone(),
            status: PipelineStatus::Queued,
            parent_execution_id: e.parent_execution_id.clone(),
            parent_step_execution_id: e.parent_step_execution_id.clone(),
            step_status: BTreeMap::new(),
            step_executions: BTreeMap::new(),
            errors: Vec::new(),
            pipeline_output: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_execution_id.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the planner may start new steps
    pub fn is_runnable(&self) -> bool {
        matches!(self.status, PipelineStatus::Started)
    }

    /// Whether a step has been planned (it appears in `step_status`)
    pub fn is_step_planned(&self, step_name: &str) -> bool {
        self.step_status.contains_key(step_name)
    }

    /// A planned step is complete once it has at least one status entry
    /// and every entry reports full progress
    pub fn is_step_complete(&self, step_name: &str) -> bool {
        match self.step_status.get(step_name) {
            Some(keys) if !keys.is_empty() => keys.values().all(StepStatus::is_complete),
            _ => false,
        }
    }

    /// Every planned step reports 100% progress
    pub fn all_steps_complete(&self) -> bool {
        self.step_status.keys().all(|name| self.is_step_complete(name))
    }

    /// True when any step attempt truly failed
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
            || self
                .step_status
                .values()
                .flat_map(|keys| keys.values())
                .any(StepStatus::has_failures)
    }

    /// (complete entries, total entries) across all steps and keys
    pub fn progress_summary(&self) -> (usize, usize) {
        let entries: Vec<&StepStatus> = self.step_status.values().flat_map(|k| k.values()).collect();
        let done = entries.iter().filter(|s| s.is_complete()).count();
        (done, entries.len())
    }

    pub fn step_execution(&self, step_execution_id: &str) -> Result<&StepExecution, ExecutionError> {
        self.step_executions
            .get(step_execution_id)
            .ok_or_else(|| ExecutionError::StepExecutionNotFound {
                pipeline_execution_id: self.id.clone(),
                step_execution_id: step_execution_id.to_string(),
            })
    }

    /// Merge step errors into the pipeline's error list
    pub fn record_errors<I>(&mut self, errors: I) -> usize
    where
        I: IntoIterator<Item = StepError>,
    {
        merge_errors(&mut self.errors, errors)
    }

    fn transition(&mut self, next: PipelineStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                pipeline_execution_id = %self.id,
                from = %self.status,
                to = %next,
                "Ignoring pipeline status transition"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(at);
        }
        true
    }

    fn step_status_mut(&mut self, step_name: &str, key: &str) -> &mut StepStatus {
        self.step_status
            .entry(step_name.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
    }
}

/// Everything triggered by one external stimulus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,

    /// Flat map of all pipeline executions, nested or not
    pub pipeline_executions: BTreeMap<String, PipelineExecution>,
}

impl Execution {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pipeline_executions: BTreeMap::new(),
        }
    }

    /// Rebuild an execution by folding its log in order.
    ///
    /// An empty log means the execution does not exist.
    pub fn from_log(id: &str, entries: &[LogEntry]) -> Result<Self, ExecutionError> {
        if entries.is_empty() {
            return Err(ExecutionError::NotFound(id.to_string()));
        }
        entries
            .iter()
            .try_fold(Self::new(id), |execution, entry| execution.apply_entry(entry))
    }

    /// Apply one stored log entry
    pub fn apply_entry(self, entry: &LogEntry) -> Result<Self, ExecutionError> {
        if entry.execution_id != self.id {
            return Err(ExecutionError::ExecutionIdMismatch {
                expected: self.id.clone(),
                found: entry.execution_id.clone(),
            });
        }

        let message = entry.decode().map_err(|source| ExecutionError::MalformedPayload {
            fact_type: entry.fact_type.clone(),
            sequence: entry.sequence,
            source,
        })?;

        match message {
            Some(message) => self.apply(&message, entry.created_at),
            None => {
                debug!(
                    execution_id = %self.id,
                    fact_type = %entry.fact_type,
                    sequence = entry.sequence,
                    "Skipping unknown fact type"
                );
                Ok(self)
            }
        }
    }

    /// Apply one fact, producing the next aggregate value
    pub fn apply(mut self, message: &Message, at: DateTime<Utc>) -> Result<Self, ExecutionError> {
        match message {
            Message::Command(command) => match command {
                Command::StepQueue(c) => self.on_step_queue(c)?,
                Command::StepStart(c) => self.on_step_start(c, at)?,
                Command::PipelineFinish(c) => self.on_pipeline_finish(c, at)?,
                Command::PipelineQueue(_)
                | Command::PipelineLoad(_)
                | Command::PipelineStart(_)
                | Command::PipelinePlan(_)
                | Command::PipelineFail(_)
                | Command::PipelineCancel(_)
                | Command::PipelinePause(_)
                | Command::PipelineResume(_)
                | Command::StepForEachPlan(_)
                | Command::StepPipelineFinish(_) => {}
            },
            Message::Event(event) => match event {
                Event::PipelineQueued(e) => self.on_pipeline_queued(e)?,
                Event::PipelineStarted(e) => self.on_pipeline_started(e, at)?,
                Event::PipelineResumed(e) => self.on_pipeline_resumed(e, at)?,
                Event::PipelinePaused(e) => self.on_pipeline_paused(e, at)?,
                Event::PipelinePlanned(e) => self.on_pipeline_planned(e)?,
                Event::PipelineCanceled(e) => self.on_pipeline_canceled(e, at)?,
                Event::PipelineFinished(e) => self.on_pipeline_finished(e, at)?,
                Event::PipelineFailed(e) => self.on_pipeline_failed(e, at)?,
                Event::StepForEachPlanned(e) => self.on_step_for_each_planned(e)?,
                Event::StepPipelineStarted(e) => self.on_step_pipeline_started(e, at)?,
                Event::StepFinished(e) => self.on_step_finished(e, at)?,
                Event::PipelineLoaded(_) => {}
            },
        }
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn pipeline_execution(&self, id: &str) -> Result<&PipelineExecution, ExecutionError> {
        self.pipeline_executions
            .get(id)
            .ok_or_else(|| ExecutionError::PipelineExecutionNotFound(id.to_string()))
    }

    fn pipeline_execution_mut(&mut self, id: &str) -> Result<&mut PipelineExecution, ExecutionError> {
        self.pipeline_executions
            .get_mut(id)
            .ok_or_else(|| ExecutionError::PipelineExecutionNotFound(id.to_string()))
    }

    /// The pipeline execution with no parent
    pub fn root(&self) -> Option<&PipelineExecution> {
        self.pipeline_executions.values().find(|pe| pe.is_root())
    }

    /// True once every pipeline execution reached a terminal status
    pub fn is_complete(&self) -> bool {
        !self.pipeline_executions.is_empty()
            && self.pipeline_executions.values().all(PipelineExecution::is_terminal)
    }

    /// The step execution that launched the given pipeline, if any
    pub fn parent_step_execution(&self, pipeline_execution_id: &str) -> Result<Option<&StepExecution>, ExecutionError> {
        let pe = self.pipeline_execution(pipeline_execution_id)?;
        let (Some(parent_id), Some(parent_step_id)) = (&pe.parent_execution_id, &pe.parent_step_execution_id) else {
            return Ok(None);
        };

        let parent = self.pipeline_execution(parent_id)?;
        parent
            .step_executions
            .get(parent_step_id)
            .map(Some)
            .ok_or_else(|| ExecutionError::ParentStepExecutionNotFound {
                pipeline_execution_id: parent_id.clone(),
                step_execution_id: parent_step_id.clone(),
            })
    }

    /// Direct children of a pipeline execution
    pub fn child_pipeline_executions<'a>(&'a self, pipeline_execution_id: &'a str) -> impl Iterator<Item = &'a PipelineExecution> + 'a {
        self.pipeline_executions
            .values()
            .filter(move |pe| pe.parent_execution_id.as_deref() == Some(pipeline_execution_id))
    }

    /// Outputs of all finished steps, keyed by step name.
    ///
    /// A step that does not fan out maps to the output variables of its last
    /// finished attempt; a for-each step maps to an object keyed by for-each key.
    pub fn pipeline_step_outputs(&self, pipeline_execution_id: &str) -> Result<Map<String, Value>, ExecutionError> {
        let pe = self.pipeline_execution(pipeline_execution_id)?;
        let mut outputs = Map::new();

        for (step_name, keys) in &pe.step_status {
            let mut per_key = Map::new();
            let mut fans_out = false;

            for (key, status) in keys {
                let last = status.step_executions.iter().rev().find(|se| se.output.is_some());
                if let Some(se) = last {
                    fans_out |= se.step_for_each.is_some();
                    let vars = se
                        .output
                        .as_ref()
                        .map(|o| Value::Object(o.output_variables.clone()))
                        .unwrap_or(Value::Null);
                    per_key.insert(key.clone(), vars);
                }
            }

            if per_key.is_empty() {
                continue;
            }
            let value = if fans_out || per_key.len() > 1 {
                Value::Object(per_key)
            } else {
                per_key.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
            };
            outputs.insert(step_name.clone(), value);
        }

        Ok(outputs)
    }

    /// Step outputs plus the pipeline arguments under `args`
    pub fn pipeline_data(&self, pipeline_execution_id: &str) -> Result<Map<String, Value>, ExecutionError> {
        let mut data = self.pipeline_step_outputs(pipeline_execution_id)?;
        let pe = self.pipeline_execution(pipeline_execution_id)?;
        data.insert("args".to_string(), Value::Object(pe.args.clone()));
        Ok(data)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn on_pipeline_queued(&mut self, e: &PipelineQueued) -> Result<(), ExecutionError> {
        if self.pipeline_executions.contains_key(&e.pipeline_execution_id) {
            return Ok(());
        }

        if let (Some(parent_id), Some(parent_step_id)) = (&e.parent_execution_id, &e.parent_step_execution_id) {
            let parent = self.pipeline_execution(parent_id)?;
            if !parent.step_executions.contains_key(parent_step_id) {
                return Err(ExecutionError::ParentStepExecutionNotFound {
                    pipeline_execution_id: parent_id.clone(),
                    step_execution_id: parent_step_id.clone(),
                });
            }
        }

        self.pipeline_executions
            .insert(e.pipeline_execution_id.clone(), PipelineExecution::from_queued(e));
        Ok(())
    }

    fn on_pipeline_started(&mut self, e: &PipelineStarted, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;
        if pe.transition(PipelineStatus::Started, at) && pe.start_time.is_none() {
            pe.start_time = Some(at);
        }
        Ok(())
    }

    fn on_pipeline_resumed(&mut self, e: &PipelineResumed, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;
        if pe.status == PipelineStatus::Paused {
            pe.transition(PipelineStatus::Started, at);
        }
        Ok(())
    }

    fn on_pipeline_paused(&mut self, e: &PipelinePaused, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        self.pipeline_execution_mut(&e.pipeline_execution_id)?
            .transition(PipelineStatus::Paused, at);
        Ok(())
    }

    fn on_pipeline_canceled(&mut self, e: &PipelineCanceled, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        self.pipeline_execution_mut(&e.pipeline_execution_id)?
            .transition(PipelineStatus::Canceled, at);
        Ok(())
    }

    fn on_pipeline_planned(&mut self, e: &PipelinePlanned) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;
        for step_name in &e.next_steps {
            pe.step_status.entry(step_name.clone()).or_default();
        }
        Ok(())
    }

    fn on_step_for_each_planned(&mut self, e: &StepForEachPlanned) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;
        let keys = pe.step_status.entry(e.step_name.clone()).or_default();

        if e.next_steps.is_empty() {
            if keys.is_empty() {
                keys.insert(
                    super::step::DEFAULT_FOR_EACH_KEY.to_string(),
                    StepStatus::empty_for_each(),
                );
            } else {
                for status in keys.values_mut() {
                    status.overall_state = Some(super::step::OverallState::CompleteOrFail);
                }
            }
            return Ok(());
        }

        for item in &e.next_steps {
            keys.entry(item.key.clone()).or_insert_with(StepStatus::initializing);
        }
        Ok(())
    }

    fn on_step_queue(&mut self, c: &StepQueue) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&c.pipeline_execution_id)?;
        if pe.step_executions.contains_key(&c.step_execution_id) {
            return Ok(());
        }

        let mut se = StepExecution::new(
            c.step_execution_id.clone(),
            c.pipeline_execution_id.clone(),
            c.step_name.clone(),
        );
        se.input = c.step_input.clone();
        se.step_for_each = c.step_for_each.clone();
        se.step_loop = c.step_loop;
        se.step_retry = c.step_retry;

        let key = se.for_each_key().to_string();
        pe.step_executions.insert(se.id.clone(), se);
        pe.step_status_mut(&c.step_name, &key).queue(&c.step_execution_id);
        Ok(())
    }

    fn on_step_start(&mut self, c: &StepStart, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&c.pipeline_execution_id)?;
        let se = pe
            .step_executions
            .get_mut(&c.step_execution_id)
            .ok_or_else(|| ExecutionError::StepExecutionNotFound {
                pipeline_execution_id: c.pipeline_execution_id.clone(),
                step_execution_id: c.step_execution_id.clone(),
            })?;

        if se.end_time.is_some() {
            return Ok(());
        }
        se.start_time = Some(at);
        se.step_loop = c.step_loop;
        se.step_retry = c.step_retry;
        se.status = StepExecutionStatus::Started;

        let (name, key) = (se.name.clone(), se.for_each_key().to_string());
        pe.step_status_mut(&name, &key).start(&c.step_execution_id);
        Ok(())
    }

    fn on_step_pipeline_started(&mut self, e: &StepPipelineStarted, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;
        let se = pe
            .step_executions
            .get_mut(&e.step_execution_id)
            .ok_or_else(|| ExecutionError::StepExecutionNotFound {
                pipeline_execution_id: e.pipeline_execution_id.clone(),
                step_execution_id: e.step_execution_id.clone(),
            })?;

        if se.end_time.is_some() {
            return Ok(());
        }
        se.status = StepExecutionStatus::Started;
        se.start_time.get_or_insert(at);

        let (name, key) = (se.name.clone(), se.for_each_key().to_string());
        pe.step_status_mut(&name, &key).start(&e.step_execution_id);
        Ok(())
    }

    fn on_step_finished(&mut self, e: &StepFinished, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;
        let se = pe
            .step_executions
            .get_mut(&e.step_execution_id)
            .ok_or_else(|| ExecutionError::StepExecutionNotFound {
                pipeline_execution_id: e.pipeline_execution_id.clone(),
                step_execution_id: e.step_execution_id.clone(),
            })?;

        if se.end_time.is_some() {
            debug!(step_execution_id = %se.id, "Ignoring duplicate step finish");
            return Ok(());
        }

        let loop_hold = e.step_loop.map(|l| !l.loop_completed).unwrap_or(false);
        let error_hold = e.step_retry.map(|r| !r.retry_completed).unwrap_or(false);

        // Loop and retry completion are only known once the attempt ends.
        se.step_loop = e.step_loop;
        se.step_retry = e.step_retry;

        match &e.output {
            Some(output) => {
                se.status = output.status;
                se.output = Some(output.clone());
            }
            None => {
                warn!(step_execution_id = %se.id, "Step execution finished without output");
                se.status = StepExecutionStatus::Finished;
            }
        }
        if !e.step_output.is_empty() {
            se.step_output = e.step_output.clone();
        }
        se.end_time = Some(at);

        let snapshot = se.clone();
        let (name, key) = (snapshot.name.clone(), snapshot.for_each_key().to_string());

        let status = pe.step_status_mut(&name, &key);
        status.step_executions.push(snapshot);

        match &e.output {
            Some(output) if output.has_errors() => {
                if output.failure_mode == FailureMode::Ignored {
                    status.finish(&e.step_execution_id, loop_hold, error_hold);
                } else {
                    status.fail(&e.step_execution_id, loop_hold, error_hold);
                    // Errors of a retried attempt only count once retries are exhausted.
                    if !error_hold {
                        pe.record_errors(output.errors.iter().cloned());
                    }
                }
            }
            _ => {
                status.finish(&e.step_execution_id, loop_hold, error_hold);
            }
        }
        Ok(())
    }

    fn on_pipeline_finish(&mut self, c: &PipelineFinish, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        self.pipeline_execution_mut(&c.pipeline_execution_id)?
            .transition(PipelineStatus::Finishing, at);
        Ok(())
    }

    fn on_pipeline_finished(&mut self, e: &PipelineFinished, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;
        if pe.transition(PipelineStatus::Finished, at) {
            pe.pipeline_output = Some(e.pipeline_output.clone());
        }
        Ok(())
    }

    fn on_pipeline_failed(&mut self, e: &PipelineFailed, at: DateTime<Utc>) -> Result<(), ExecutionError> {
        let pe = self.pipeline_execution_mut(&e.pipeline_execution_id)?;

        // Failures recorded directly bypass step-level aggregation, so merge
        // them here with the same dedup rule.
        pe.record_errors(e.errors.iter().cloned());

        if pe.transition(PipelineStatus::Failed, at) {
            let mut output = e
                .pipeline_output
                .clone()
                .or_else(|| pe.pipeline_output.clone())
                .unwrap_or_default();
            output.insert(
                "errors".to_string(),
                serde_json::to_value(&pe.errors).unwrap_or(Value::Null),
            );
            pe.pipeline_output = Some(output);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step::{StepOutput, StepRetry};

    fn queued(id: &str) -> Message {
        Event::from(PipelineQueued {
            pipeline_execution_id: id.to_string(),
            name: "demo".to_string(),
            args: Map::new(),
            parent_execution_id: None,
            parent_step_execution_id: None,
        })
        .into()
    }

    fn started(id: &str) -> Message {
        Event::from(PipelineStarted {
            pipeline_execution_id: id.to_string(),
        })
        .into()
    }

    fn step_queue(pe: &str, se: &str, name: &str) -> Message {
        Command::from(StepQueue {
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

    fn fold(messages: &[Message]) -> Execution {
        messages
            .iter()
            .try_fold(Execution::new("exec_1"), |ex, m| ex.apply(m, Utc::now()))
            .unwrap()
    }

    #[test]
    fn test_status_transitions() {
        use PipelineStatus::*;
        assert!(Queued.can_transition_to(Started));
        assert!(Started.can_transition_to(Finishing));
        assert!(Finishing.can_transition_to(Finished));
        assert!(Started.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Started));
        assert!(Paused.can_transition_to(Canceled));
        assert!(!Paused.can_transition_to(Finishing));
        assert!(!Finished.can_transition_to(Started));
        assert!(!Canceled.can_transition_to(Finished));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Finishing.can_transition_to(Started));
    }

    #[test]
    fn test_queue_and_start_pipeline() {
        let ex = fold(&[queued("p1"), started("p1")]);
        let pe = ex.pipeline_execution("p1").unwrap();
        assert_eq!(pe.status, PipelineStatus::Started);
        assert!(pe.start_time.is_some());
        assert!(pe.is_root());
    }

    #[test]
    fn test_step_finish_records_history() {
        let ex = fold(&[
            queued("p1"),
            started("p1"),
            step_queue("p1", "s1", "a"),
            step_finished("p1", "s1", StepOutput::finished(Map::new()), None),
        ]);
        let pe = ex.pipeline_execution("p1").unwrap();
        let status = &pe.step_status["a"]["0"];
        assert!(status.finished.contains("s1"));
        assert_eq!(status.step_executions.len(), 1);
        assert!(pe.all_steps_complete());
    }

    #[test]
    fn test_retried_failure_errors_are_deferred() {
        let err = StepError::execution("boom");
        let ex = fold(&[
            queued("p1"),
            started("p1"),
            step_queue("p1", "s1", "a"),
            step_finished(
                "p1",
                "s1",
                StepOutput::failed(vec![err.clone()]),
                Some(StepRetry {
                    attempt: 1,
                    retry_completed: false,
                }),
            ),
        ]);
        let pe = ex.pipeline_execution("p1").unwrap();
        assert!(pe.errors.is_empty());
        assert!(pe.step_status["a"]["0"].failed.is_empty());
        assert!(!pe.all_steps_complete());
    }

    #[test]
    fn test_step_finish_for_unknown_step_is_fatal() {
        let result = fold(&[queued("p1")]).apply(
            &step_finished("p1", "missing", StepOutput::default(), None),
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(ExecutionError::StepExecutionNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_log_is_not_found() {
        let result = Execution::from_log("exec_missing", &[]);
        assert!(matches!(result, Err(ExecutionError::NotFound(_))));
    }

    #[test]
    fn test_finished_after_cancel_is_ignored() {
        let canceled: Message = Event::from(PipelineCanceled {
            pipeline_execution_id: "p1".to_string(),
            reason: None,
        })
        .into();
        let finished: Message = Event::from(PipelineFinished {
            pipeline_execution_id: "p1".to_string(),
            pipeline_output: Map::new(),
        })
        .into();

        let ex = fold(&[queued("p1"), started("p1"), canceled, finished]);
        let pe = ex.pipeline_execution("p1").unwrap();
        assert_eq!(pe.status, PipelineStatus::Canceled);
        assert!(pe.pipeline_output.is_none());
    }
}
