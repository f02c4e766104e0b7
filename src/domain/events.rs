//! Facts recorded in the per-execution log.
//!
//! Commands are intents, events are facts; both are appended to the same
//! ordered log and both may change aggregate state on replay. The set of
//! fact types is closed: [`Command`] and [`Event`] enumerate every type,
//! and [`LogEntry::decode`] maps a stored type name back to its variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::StepError;
use super::step::{StepForEach, StepInput, StepLoop, StepOutput, StepRetry};

/// Defines a closed fact enum together with its stored type names.
macro_rules! fact_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $type_name:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub enum $name {
            $($variant($variant),)+
        }

        impl $name {
            /// Type name as stored in the log
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $type_name,)+
                }
            }

            /// Pipeline execution this fact is about
            pub fn pipeline_execution_id(&self) -> &str {
                match self {
                    $(Self::$variant(fact) => &fact.pipeline_execution_id,)+
                }
            }

            fn payload(&self) -> serde_json::Result<Value> {
                match self {
                    $(Self::$variant(fact) => serde_json::to_value(fact),)+
                }
            }

            /// `None` when `type_name` is not one of ours
            fn decode(type_name: &str, payload: &Value) -> Option<serde_json::Result<Self>> {
                $(
                    if type_name == $type_name {
                        return Some(
                            $variant::deserialize(payload).map(Self::$variant),
                        );
                    }
                )+
                None
            }
        }

        $(
            impl From<$variant> for $name {
                fn from(fact: $variant) -> Self {
                    Self::$variant(fact)
                }
            }
        )+
    };
}

fact_enum! {
    /// Intents. Every command has exactly one handler.
    Command {
        PipelineQueue => "command.pipeline_queue",
        PipelineLoad => "command.pipeline_load",
        PipelineStart => "command.pipeline_start",
        PipelinePlan => "command.pipeline_plan",
        PipelineFinish => "command.pipeline_finish",
        PipelineFail => "command.pipeline_fail",
        PipelineCancel => "command.pipeline_cancel",
        PipelinePause => "command.pipeline_pause",
        PipelineResume => "command.pipeline_resume",
        StepQueue => "command.step_queue",
        StepStart => "command.step_start",
        StepForEachPlan => "command.step_for_each_plan",
        StepPipelineFinish => "command.step_pipeline_finish",
    }
}

fact_enum! {
    /// Facts. Events may have zero or more reactions.
    Event {
        PipelineQueued => "event.pipeline_queued",
        PipelineLoaded => "event.pipeline_loaded",
        PipelineStarted => "event.pipeline_started",
        PipelinePlanned => "event.pipeline_planned",
        PipelineFinished => "event.pipeline_finished",
        PipelineFailed => "event.pipeline_failed",
        PipelineCanceled => "event.pipeline_canceled",
        PipelinePaused => "event.pipeline_paused",
        PipelineResumed => "event.pipeline_resumed",
        StepForEachPlanned => "event.step_for_each_planned",
        StepPipelineStarted => "event.step_pipeline_started",
        StepFinished => "event.step_finished",
    }
}

// ============================================================================
// Command payloads
// ============================================================================

/// Queue a pipeline (root or child) for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineQueue {
    pub pipeline_execution_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Parent pipeline execution, for child pipelines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    /// Parent step execution that launched this pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_execution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLoad {
    pub pipeline_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStart {
    pub pipeline_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub pipeline_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFinish {
    pub pipeline_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFail {
    pub pipeline_execution_id: String,
    #[serde(default)]
    pub errors: Vec<StepError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCancel {
    pub pipeline_execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePause {
    pub pipeline_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResume {
    pub pipeline_execution_id: String,
}

/// Queue one attempt of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepQueue {
    pub pipeline_execution_id: String,
    pub step_execution_id: String,
    pub step_name: String,
    #[serde(default)]
    pub step_input: StepInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_for_each: Option<StepForEach>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_loop: Option<StepLoop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_retry: Option<StepRetry>,
    /// Delay before the attempt runs (retry backoff)
    #[serde(default)]
    pub delay_ms: u64,
}

/// Start a queued step attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStart {
    pub pipeline_execution_id: String,
    pub step_execution_id: String,
    pub step_name: String,
    #[serde(default)]
    pub step_input: StepInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_for_each: Option<StepForEach>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_loop: Option<StepLoop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_retry: Option<StepRetry>,
    #[serde(default)]
    pub delay_ms: u64,
}

impl From<&StepQueue> for StepStart {
    fn from(queue: &StepQueue) -> Self {
        Self {
            pipeline_execution_id: queue.pipeline_execution_id.clone(),
            step_execution_id: queue.step_execution_id.clone(),
            step_name: queue.step_name.clone(),
            step_input: queue.step_input.clone(),
            step_for_each: queue.step_for_each.clone(),
            step_loop: queue.step_loop,
            step_retry: queue.step_retry,
            delay_ms: queue.delay_ms,
        }
    }
}

/// Resolve the for-each items of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepForEachPlan {
    pub pipeline_execution_id: String,
    pub step_name: String,
}

/// A child pipeline reached a terminal state; finish the parent's step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPipelineFinish {
    /// The parent pipeline execution
    pub pipeline_execution_id: String,
    /// The parent's step execution that launched the child
    pub step_execution_id: String,
    pub child_pipeline_execution_id: String,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub errors: Vec<StepError>,
}

// ============================================================================
// Event payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineQueued {
    pub pipeline_execution_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_execution_id: Option<String>,
}

impl From<&PipelineQueue> for PipelineQueued {
    fn from(cmd: &PipelineQueue) -> Self {
        Self {
            pipeline_execution_id: cmd.pipeline_execution_id.clone(),
            name: cmd.name.clone(),
            args: cmd.args.clone(),
            parent_execution_id: cmd.parent_execution_id.clone(),
            parent_step_execution_id: cmd.parent_step_execution_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLoaded {
    pub pipeline_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStarted {
    pub pipeline_execution_id: String,
}

/// Planning result; empty `next_steps` means "re-check completion"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlanned {
    pub pipeline_execution_id: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFinished {
    pub pipeline_execution_id: String,
    #[serde(default)]
    pub pipeline_output: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFailed {
    pub pipeline_execution_id: String,
    #[serde(default)]
    pub errors: Vec<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_output: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCanceled {
    pub pipeline_execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePaused {
    pub pipeline_execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResumed {
    pub pipeline_execution_id: String,
}

/// For-each items of a step; empty `next_steps` means the expansion is done
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepForEachPlanned {
    pub pipeline_execution_id: String,
    pub step_name: String,
    #[serde(default)]
    pub next_steps: Vec<StepForEach>,
}

/// A pipeline step launched a child pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPipelineStarted {
    pub pipeline_execution_id: String,
    pub step_execution_id: String,
    pub child_pipeline_execution_id: String,
    pub child_pipeline_name: String,
    #[serde(default)]
    pub child_pipeline_args: Map<String, Value>,
}

/// A step attempt finished (successfully or not)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinished {
    pub pipeline_execution_id: String,
    pub step_execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_for_each: Option<StepForEach>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_loop: Option<StepLoop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_retry: Option<StepRetry>,
    pub output: Option<StepOutput>,
    #[serde(default)]
    pub step_output: Map<String, Value>,
}

// ============================================================================
// Messages, envelopes and log entries
// ============================================================================

/// Anything that flows through the dispatch fabric
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Event(Event),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Command(c) => c.type_name(),
            Self::Event(e) => e.type_name(),
        }
    }

    pub fn pipeline_execution_id(&self) -> &str {
        match self {
            Self::Command(c) => c.pipeline_execution_id(),
            Self::Event(e) => e.pipeline_execution_id(),
        }
    }

    /// Serialized payload (without the type name)
    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::Command(c) => c.payload(),
            Self::Event(e) => e.payload(),
        }
    }

    /// True for the facts that make up the failure path
    pub fn is_failure_path(&self) -> bool {
        matches!(
            self,
            Self::Command(Command::PipelineFail(_)) | Self::Event(Event::PipelineFailed(_))
        )
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// A message addressed to one execution
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub execution_id: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(execution_id: impl Into<String>, message: impl Into<Message>) -> Self {
        Self {
            execution_id: execution_id.into(),
            message: message.into(),
        }
    }

    pub fn command(execution_id: impl Into<String>, command: impl Into<Command>) -> Self {
        Self::new(execution_id, Message::Command(command.into()))
    }

    pub fn event(execution_id: impl Into<String>, event: impl Into<Event>) -> Self {
        Self::new(execution_id, Message::Event(event.into()))
    }
}

/// One line of the fact log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub execution_id: String,

    /// Position within the execution's log, starting at 1
    pub sequence: u64,

    #[serde(rename = "type")]
    pub fact_type: String,

    pub created_at: DateTime<Utc>,

    pub payload: Value,
}

impl LogEntry {
    /// Build a log entry for a message
    pub fn from_envelope(envelope: &Envelope, sequence: u64) -> serde_json::Result<Self> {
        Ok(Self {
            execution_id: envelope.execution_id.clone(),
            sequence,
            fact_type: envelope.message.type_name().to_string(),
            created_at: Utc::now(),
            payload: envelope.message.payload()?,
        })
    }

    /// Decode the payload into a message.
    ///
    /// `Ok(None)` means the type is unknown to this version and should be
    /// skipped; `Err` means a known type carried a malformed payload.
    pub fn decode(&self) -> serde_json::Result<Option<Message>> {
        if let Some(result) = Command::decode(&self.fact_type, &self.payload) {
            return result.map(|c| Some(Message::Command(c)));
        }
        if let Some(result) = Event::decode(&self.fact_type, &self.payload) {
            return result.map(|e| Some(Message::Event(e)));
        }
        Ok(None)
    }

    pub fn envelope(&self) -> serde_json::Result<Option<Envelope>> {
        Ok(self.decode()?.map(|message| Envelope {
            execution_id: self.execution_id.clone(),
            message,
        }))
    }
}
