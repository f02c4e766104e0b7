//! Dispatch fabric.
//!
//! Every fact is delivered through an ordered lane owned by its execution.
//! Processing one fact means: take the execution lock, replay the log, run
//! the fact's handler, append whatever the handler produced as one batch,
//! route the new facts to the lane and release the lock. Step runners are
//! spawned only after the lock is released.
//!
//! A handler error (or panic) is turned into a `pipeline_fail` command for
//! the affected pipeline execution. Errors on the failure path itself are
//! logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::adapters::RunnerRegistry;
use crate::domain::errors::{ERROR_CODE_BAD_REQUEST, ERROR_CODE_CANCELED, ERROR_CODE_INTERNAL};
use crate::domain::events::*;
use crate::domain::ids::new_pipeline_execution_id;
use crate::domain::{
    Command, Envelope, Event, Execution, ExecutionError, Message, PipelineExecution, PipelineStatus, StepError,
    StepExecutionStatus, StepForEach, StepInput, StepLoop, StepOutput, StepRetry,
};

use super::credentials::CredentialProvider;
use super::event_store::EventStore;
use super::locks::ExecutionLocks;
use super::pipeline::{DefinitionProvider, PipelineDefinition, StepDefinition};
use super::planner;

/// Errors raised while handling a fact
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Pipeline definition not found: {0}")]
    MissingDefinition(String),

    #[error("Step '{step}' not found in pipeline '{pipeline}'")]
    MissingStep { pipeline: String, step: String },

    #[error("Step '{step}' has unsupported type '{step_type}'")]
    UnsupportedStepType { step: String, step_type: String },

    #[error("Step type '{0}' is not implemented")]
    NotImplemented(String),

    #[error("Invalid for_each on step '{step}': {reason}")]
    InvalidForEach { step: String, reason: String },

    #[error("Pipeline output '{0}' could not be resolved")]
    Output(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panic(String),
}

impl DispatchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Execution(_) | Self::Store(_) | Self::Panic(_) => ERROR_CODE_INTERNAL,
            _ => ERROR_CODE_BAD_REQUEST,
        }
    }

    /// The error as recorded on the failed pipeline
    pub fn to_step_error(&self) -> StepError {
        StepError::new(self.error_code(), self.to_string())
    }
}

/// Notice that a root pipeline reached a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub execution_id: String,
    pub pipeline_execution_id: String,
    pub status: PipelineStatus,
    pub output: Option<Map<String, Value>>,
}

/// Knobs for the dispatch fabric
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Default runner timeout for steps without their own
    pub step_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
        }
    }
}

/// One step attempt to hand to a runner once the lock is released
#[derive(Debug, Clone)]
struct StepRun {
    execution_id: String,
    pipeline_execution_id: String,
    step_execution_id: String,
    step: StepDefinition,
    input: StepInput,
    step_for_each: Option<StepForEach>,
    step_loop: Option<StepLoop>,
    step_retry: Option<StepRetry>,
    delay_ms: u64,
}

/// What a handler decided
#[derive(Default)]
struct Reaction {
    messages: Vec<Message>,
    runs: Vec<StepRun>,
    completion: Option<Completion>,
}

impl Reaction {
    fn none() -> Self {
        Self::default()
    }

    fn command(command: impl Into<Command>) -> Self {
        Self::commands(vec![command.into()])
    }

    fn event(event: impl Into<Event>) -> Self {
        Self {
            messages: vec![Message::Event(event.into())],
            ..Default::default()
        }
    }

    fn commands(commands: Vec<Command>) -> Self {
        Self {
            messages: commands.into_iter().map(Message::Command).collect(),
            ..Default::default()
        }
    }
}

struct Inner {
    store: EventStore,
    locks: ExecutionLocks,
    definitions: Arc<dyn DefinitionProvider>,
    runners: RunnerRegistry,
    credentials: Arc<dyn CredentialProvider>,
    settings: DispatchSettings,
    lanes: DashMap<String, mpsc::UnboundedSender<Envelope>>,
    completions: broadcast::Sender<Completion>,
}

/// Typed router driving executions forward
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        store: EventStore,
        definitions: Arc<dyn DefinitionProvider>,
        runners: RunnerRegistry,
        credentials: Arc<dyn CredentialProvider>,
        settings: DispatchSettings,
    ) -> Self {
        let (completions, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                store,
                locks: ExecutionLocks::new(),
                definitions,
                runners,
                credentials,
                settings,
                lanes: DashMap::new(),
                completions,
            }),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionProvider> {
        &self.inner.definitions
    }

    /// Receive a notice whenever a root pipeline settles
    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.inner.completions.subscribe()
    }

    /// External ingress: record a fact and deliver it
    pub async fn submit(&self, envelope: Envelope) -> anyhow::Result<()> {
        let execution_id = envelope.execution_id.clone();
        let _guard = self.inner.locks.acquire(&execution_id).await;
        self.inner
            .store
            .append_batch(&execution_id, std::slice::from_ref(&envelope))
            .await?;
        self.route(envelope);
        Ok(())
    }

    /// Load an execution under its lock
    pub async fn load(&self, execution_id: &str) -> anyhow::Result<Execution> {
        let _guard = self.inner.locks.acquire(execution_id).await;
        self.inner.store.load(execution_id).await
    }

    fn route(&self, envelope: Envelope) {
        let lane = self
            .inner
            .lanes
            .entry(envelope.execution_id.clone())
            .or_insert_with(|| self.spawn_lane(&envelope.execution_id))
            .clone();

        if let Err(err) = lane.send(envelope) {
            // The lane task is gone; open a fresh lane for the same execution.
            let envelope = err.0;
            warn!(execution_id = %envelope.execution_id, "Lane closed, reopening");
            let lane = self.spawn_lane(&envelope.execution_id);
            self.inner.lanes.insert(envelope.execution_id.clone(), lane.clone());
            let _ = lane.send(envelope);
        }
    }

    fn spawn_lane(&self, execution_id: &str) -> mpsc::UnboundedSender<Envelope> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let this = self.clone();
        let execution_id = execution_id.to_string();
        let span = tracing::info_span!("lane", execution_id = %execution_id);

        tokio::spawn(
            async move {
                while let Some(envelope) = rx.recv().await {
                    let settled = this.process(envelope).await;
                    if settled && this.close_idle_lane(&execution_id, &rx).await {
                        break;
                    }
                }
                debug!("Lane closed");
            }
            .instrument(span),
        );
        tx
    }

    /// Retire the lane of a settled execution once nothing is buffered.
    ///
    /// Routing only happens under the execution lock, so an empty queue
    /// observed under the lock stays empty until the lane is unregistered.
    /// A later fact for the same execution opens a fresh lane.
    async fn close_idle_lane(&self, execution_id: &str, rx: &mpsc::UnboundedReceiver<Envelope>) -> bool {
        let guard = self.inner.locks.acquire(execution_id).await;
        if !rx.is_empty() {
            return false;
        }
        self.inner.lanes.remove(execution_id);
        self.inner.store.forget(execution_id);
        drop(guard);
        self.inner.locks.release(execution_id);
        true
    }

    /// Handle one fact. Returns whether the execution's root had already
    /// settled when the fact was handled.
    #[instrument(skip_all, fields(fact = envelope.message.type_name(), pipeline_execution_id = %envelope.message.pipeline_execution_id()))]
    async fn process(&self, envelope: Envelope) -> bool {
        let execution_id = envelope.execution_id.clone();
        let (runs, completion, settled) = {
            let _guard = self.inner.locks.acquire(&execution_id).await;

            let execution = match self.inner.store.load(&execution_id).await {
                Ok(execution) => execution,
                Err(err) => {
                    error!(error = %err, "Failed to load execution, dropping fact");
                    return false;
                }
            };
            let settled = execution.root().map(PipelineExecution::is_terminal).unwrap_or(false);

            let reaction = self.react(execution, envelope.message.clone()).await;

            let outputs: Vec<Envelope> = reaction
                .messages
                .into_iter()
                .map(|message| Envelope::new(execution_id.clone(), message))
                .collect();

            if let Err(err) = self.inner.store.append_batch(&execution_id, &outputs).await {
                error!(error = %err, "Failed to record handler output, dropping fact");
                return false;
            }
            for output in outputs {
                debug!(fact = output.message.type_name(), "Recorded");
                self.route(output);
            }

            (reaction.runs, reaction.completion, settled)
        };

        for run in runs {
            let this = self.clone();
            tokio::spawn(async move { this.run_step(run).await });
        }

        if let Some(completion) = completion {
            info!(status = %completion.status, "Execution settled");
            let _ = self.inner.completions.send(completion);
        }
        settled
    }

    /// Run the handler in its own task so a panic is contained
    async fn react(&self, execution: Execution, message: Message) -> Reaction {
        let this = self.clone();
        let handled = {
            let message = message.clone();
            tokio::spawn(async move { this.handle(&execution, &message).await }).await
        };

        let err = match handled {
            Ok(Ok(reaction)) => return reaction,
            Ok(Err(err)) => err,
            Err(join) if join.is_panic() => DispatchError::Panic(panic_message(join.into_panic())),
            Err(join) => DispatchError::Panic(join.to_string()),
        };

        if message.is_failure_path() {
            error!(error = %err, "Failure path handler failed, dropping");
            return Reaction::none();
        }

        let target = fail_target(&message);
        error!(error = %err, pipeline_execution_id = %target, "Handler failed, failing pipeline");
        Reaction::command(PipelineFail {
            pipeline_execution_id: target,
            errors: vec![err.to_step_error()],
        })
    }

    fn definition(&self, pe: &PipelineExecution) -> Result<Arc<PipelineDefinition>, DispatchError> {
        self.inner
            .definitions
            .pipeline(&pe.name)
            .ok_or_else(|| DispatchError::MissingDefinition(pe.name.clone()))
    }

    async fn handle(&self, execution: &Execution, message: &Message) -> Result<Reaction, DispatchError> {
        match message {
            Message::Command(command) => match command {
                Command::PipelineQueue(c) => self.on_pipeline_queue(execution, c),
                Command::PipelineLoad(c) => self.on_pipeline_load(execution, c),
                Command::PipelineStart(c) => self.on_pipeline_start(execution, c),
                Command::PipelinePlan(c) => self.on_pipeline_plan(execution, c),
                Command::PipelineFinish(c) => self.on_pipeline_finish(execution, c),
                Command::PipelineFail(c) => self.on_pipeline_fail(execution, c),
                Command::PipelineCancel(c) => self.on_pipeline_cancel(execution, c),
                Command::PipelinePause(c) => self.on_pipeline_pause(execution, c),
                Command::PipelineResume(c) => self.on_pipeline_resume(execution, c),
                Command::StepQueue(c) => self.on_step_queue(execution, c),
                Command::StepStart(c) => self.on_step_start(execution, c),
                Command::StepForEachPlan(c) => self.on_step_for_each_plan(execution, c),
                Command::StepPipelineFinish(c) => self.on_step_pipeline_finish(execution, c),
            },
            Message::Event(event) => match event {
                Event::PipelineQueued(e) => Ok(Reaction::command(PipelineLoad {
                    pipeline_execution_id: e.pipeline_execution_id.clone(),
                })),
                Event::PipelineLoaded(e) => Ok(Reaction::command(PipelineStart {
                    pipeline_execution_id: e.pipeline_execution_id.clone(),
                })),
                Event::PipelineStarted(e) => Ok(Reaction::command(PipelinePlan {
                    pipeline_execution_id: e.pipeline_execution_id.clone(),
                })),
                Event::PipelinePlanned(e) => self.on_pipeline_planned(execution, e),
                Event::PipelineFinished(e) => self.on_pipeline_settled(execution, &e.pipeline_execution_id).await,
                Event::PipelineFailed(e) => self.on_pipeline_settled(execution, &e.pipeline_execution_id).await,
                Event::PipelineCanceled(e) => self.on_pipeline_canceled(execution, e).await,
                Event::PipelinePaused(_) => Ok(Reaction::none()),
                Event::PipelineResumed(e) => self.on_pipeline_resumed(execution, e),
                Event::StepForEachPlanned(e) => self.on_step_for_each_planned(execution, e),
                Event::StepPipelineStarted(e) => Ok(Reaction::command(PipelineQueue {
                    pipeline_execution_id: e.child_pipeline_execution_id.clone(),
                    name: e.child_pipeline_name.clone(),
                    args: e.child_pipeline_args.clone(),
                    parent_execution_id: Some(e.pipeline_execution_id.clone()),
                    parent_step_execution_id: Some(e.step_execution_id.clone()),
                })),
                Event::StepFinished(e) => self.on_step_finished(execution, e),
            },
        }
    }

    // ------------------------------------------------------------------
    // Command handlers
    // ------------------------------------------------------------------

    fn on_pipeline_queue(&self, execution: &Execution, c: &PipelineQueue) -> Result<Reaction, DispatchError> {
        if execution.pipeline_executions.contains_key(&c.pipeline_execution_id) {
            return Ok(Reaction::none());
        }
        if let (Some(parent_id), Some(parent_step_id)) = (&c.parent_execution_id, &c.parent_step_execution_id) {
            let parent = execution.pipeline_execution(parent_id)?;
            if !parent.step_executions.contains_key(parent_step_id) {
                return Err(ExecutionError::ParentStepExecutionNotFound {
                    pipeline_execution_id: parent_id.clone(),
                    step_execution_id: parent_step_id.clone(),
                }
                .into());
            }
        }
        Ok(Reaction::event(PipelineQueued::from(c)))
    }

    fn on_pipeline_load(&self, execution: &Execution, c: &PipelineLoad) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        self.definition(pe)?;
        Ok(Reaction::event(PipelineLoaded {
            pipeline_execution_id: pe.id.clone(),
        }))
    }

    fn on_pipeline_start(&self, execution: &Execution, c: &PipelineStart) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if pe.status != PipelineStatus::Queued {
            return Ok(Reaction::none());
        }
        Ok(Reaction::event(PipelineStarted {
            pipeline_execution_id: pe.id.clone(),
        }))
    }

    fn on_pipeline_plan(&self, execution: &Execution, c: &PipelinePlan) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if !pe.is_runnable() {
            debug!(status = %pe.status, "Pipeline not running, skipping plan");
            return Ok(Reaction::none());
        }
        let definition = self.definition(pe)?;
        Ok(Reaction::event(PipelinePlanned {
            pipeline_execution_id: pe.id.clone(),
            next_steps: planner::eligible_steps(pe, &definition),
        }))
    }

    fn on_pipeline_finish(&self, execution: &Execution, c: &PipelineFinish) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if pe.status != PipelineStatus::Finishing {
            return Ok(Reaction::none());
        }
        let definition = self.definition(pe)?;
        let step_outputs = execution.pipeline_step_outputs(&pe.id)?;
        let pipeline_output = definition.render_output(&step_outputs).map_err(DispatchError::Output)?;

        Ok(Reaction::event(PipelineFinished {
            pipeline_execution_id: pe.id.clone(),
            pipeline_output,
        }))
    }

    fn on_pipeline_fail(&self, execution: &Execution, c: &PipelineFail) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if pe.is_terminal() {
            return Ok(Reaction::none());
        }
        Ok(Reaction::event(PipelineFailed {
            pipeline_execution_id: pe.id.clone(),
            errors: c.errors.clone(),
            pipeline_output: pe.pipeline_output.clone(),
        }))
    }

    fn on_pipeline_cancel(&self, execution: &Execution, c: &PipelineCancel) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if pe.is_terminal() {
            return Ok(Reaction::none());
        }
        Ok(Reaction::event(PipelineCanceled {
            pipeline_execution_id: pe.id.clone(),
            reason: c.reason.clone(),
        }))
    }

    fn on_pipeline_pause(&self, execution: &Execution, c: &PipelinePause) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if !pe.status.can_transition_to(PipelineStatus::Paused) {
            return Ok(Reaction::none());
        }
        Ok(Reaction::event(PipelinePaused {
            pipeline_execution_id: pe.id.clone(),
        }))
    }

    fn on_pipeline_resume(&self, execution: &Execution, c: &PipelineResume) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if pe.status != PipelineStatus::Paused {
            return Ok(Reaction::none());
        }
        Ok(Reaction::event(PipelineResumed {
            pipeline_execution_id: pe.id.clone(),
        }))
    }

    fn on_step_queue(&self, execution: &Execution, c: &StepQueue) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        // A paused pipeline starts its queued steps on resume.
        if !pe.is_runnable() {
            return Ok(Reaction::none());
        }
        Ok(Reaction::command(StepStart::from(c)))
    }

    fn on_step_start(&self, execution: &Execution, c: &StepStart) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if pe.is_terminal() {
            return Ok(Reaction::none());
        }
        let definition = self.definition(pe)?;
        let step = definition.get_step(&c.step_name).ok_or_else(|| DispatchError::MissingStep {
            pipeline: definition.name.clone(),
            step: c.step_name.clone(),
        })?;

        match step.step_type.as_str() {
            "pipeline" => {
                let child_name = step
                    .pipeline
                    .clone()
                    .ok_or_else(|| DispatchError::MissingDefinition(format!("<none named by step '{}'>", step.name)))?;
                Ok(Reaction::event(StepPipelineStarted {
                    pipeline_execution_id: pe.id.clone(),
                    step_execution_id: c.step_execution_id.clone(),
                    child_pipeline_execution_id: new_pipeline_execution_id(),
                    child_pipeline_name: child_name,
                    child_pipeline_args: planner::child_args(step, &c.step_input),
                }))
            }
            "sleep" => Err(DispatchError::NotImplemented(step.step_type.clone())),
            step_type if self.inner.runners.contains(step_type) => Ok(Reaction {
                runs: vec![StepRun {
                    execution_id: execution.id.clone(),
                    pipeline_execution_id: pe.id.clone(),
                    step_execution_id: c.step_execution_id.clone(),
                    step: step.clone(),
                    input: c.step_input.clone(),
                    step_for_each: c.step_for_each.clone(),
                    step_loop: c.step_loop,
                    step_retry: c.step_retry,
                    delay_ms: c.delay_ms,
                }],
                ..Default::default()
            }),
            other => Err(DispatchError::UnsupportedStepType {
                step: step.name.clone(),
                step_type: other.to_string(),
            }),
        }
    }

    fn on_step_for_each_plan(&self, execution: &Execution, c: &StepForEachPlan) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        if !pe.is_runnable() {
            return Ok(Reaction::none());
        }
        let definition = self.definition(pe)?;
        let step = definition.get_step(&c.step_name).ok_or_else(|| DispatchError::MissingStep {
            pipeline: definition.name.clone(),
            step: c.step_name.clone(),
        })?;

        let next_steps = match &step.for_each {
            Some(source) => {
                let data = execution.pipeline_data(&pe.id)?;
                source.resolve(&data).map_err(|reason| DispatchError::InvalidForEach {
                    step: step.name.clone(),
                    reason,
                })?
            }
            None => Vec::new(),
        };

        Ok(Reaction::event(StepForEachPlanned {
            pipeline_execution_id: pe.id.clone(),
            step_name: step.name.clone(),
            next_steps,
        }))
    }

    fn on_step_pipeline_finish(&self, execution: &Execution, c: &StepPipelineFinish) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&c.pipeline_execution_id)?;
        let se = pe.step_execution(&c.step_execution_id)?;
        if pe.is_terminal() || se.end_time.is_some() {
            return Ok(Reaction::none());
        }
        let definition = self.definition(pe)?;
        let step = definition.get_step(&se.name).ok_or_else(|| DispatchError::MissingStep {
            pipeline: definition.name.clone(),
            step: se.name.clone(),
        })?;

        let mut output = StepOutput::finished(c.output.clone()).with_failure_mode(step.failure_mode);
        if !c.errors.is_empty() {
            output.status = StepExecutionStatus::Failed;
            output.errors = c.errors.clone();
        }
        output.started_at = se.start_time;
        output.finished_at = Some(chrono::Utc::now());

        let (step_loop, step_retry) = planner::continuation(step, se.step_loop, se.step_retry, &output);
        Ok(Reaction::event(StepFinished {
            pipeline_execution_id: pe.id.clone(),
            step_execution_id: se.id.clone(),
            step_for_each: se.step_for_each.clone(),
            step_loop,
            step_retry,
            step_output: step.step_output(&output.output_variables),
            output: Some(output),
        }))
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    fn on_pipeline_planned(&self, execution: &Execution, e: &PipelinePlanned) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&e.pipeline_execution_id)?;
        let definition = self.definition(pe)?;
        Ok(Reaction::commands(planner::plan(pe, &definition, &e.next_steps)?))
    }

    fn on_step_for_each_planned(&self, execution: &Execution, e: &StepForEachPlanned) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&e.pipeline_execution_id)?;
        let definition = self.definition(pe)?;
        Ok(Reaction::commands(planner::plan_for_each(pe, &definition, &e.step_name, &e.next_steps)?))
    }

    fn on_step_finished(&self, execution: &Execution, e: &StepFinished) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&e.pipeline_execution_id)?;
        let se = pe.step_execution(&e.step_execution_id)?;
        let definition = self.definition(pe)?;
        Ok(Reaction::commands(planner::after_step_finished(
            pe,
            &definition,
            se,
            e.step_loop,
            e.step_retry,
        )?))
    }

    fn on_pipeline_resumed(&self, execution: &Execution, e: &PipelineResumed) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&e.pipeline_execution_id)?;

        // Attempts queued while paused were never started.
        let mut commands: Vec<Command> = pe
            .step_executions
            .values()
            .filter(|se| se.status == StepExecutionStatus::Queued && se.end_time.is_none())
            .map(|se| {
                StepStart {
                    pipeline_execution_id: pe.id.clone(),
                    step_execution_id: se.id.clone(),
                    step_name: se.name.clone(),
                    step_input: se.input.clone(),
                    step_for_each: se.step_for_each.clone(),
                    step_loop: se.step_loop,
                    step_retry: se.step_retry,
                    delay_ms: 0,
                }
                .into()
            })
            .collect();

        let definition = self.definition(pe)?;
        commands.extend(planner::stalled_steps(pe, &definition)?);

        commands.push(
            PipelinePlan {
                pipeline_execution_id: pe.id.clone(),
            }
            .into(),
        );
        Ok(Reaction::commands(commands))
    }

    /// Unwind a finished or failed pipeline to its parent step, or settle
    /// the whole execution when it is the root
    async fn on_pipeline_settled(&self, execution: &Execution, pipeline_execution_id: &str) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(pipeline_execution_id)?;

        if let Some(parent_se) = execution.parent_step_execution(&pe.id)? {
            let mut errors = Vec::new();
            if pe.status == PipelineStatus::Failed {
                errors = pe.errors.clone();
                if errors.is_empty() {
                    errors.push(StepError::execution(format!("child pipeline '{}' failed", pe.name)));
                }
            }

            let mut output = pe.pipeline_output.clone().unwrap_or_default();
            output.remove("errors");

            return Ok(Reaction::command(StepPipelineFinish {
                pipeline_execution_id: parent_se.pipeline_execution_id.clone(),
                step_execution_id: parent_se.id.clone(),
                child_pipeline_execution_id: pe.id.clone(),
                output,
                errors,
            }));
        }

        self.settle_root(execution, pe).await
    }

    async fn on_pipeline_canceled(&self, execution: &Execution, e: &PipelineCanceled) -> Result<Reaction, DispatchError> {
        let pe = execution.pipeline_execution(&e.pipeline_execution_id)?;

        let mut commands: Vec<Command> = execution
            .child_pipeline_executions(&pe.id)
            .filter(|child| !child.is_terminal())
            .map(|child| {
                PipelineCancel {
                    pipeline_execution_id: child.id.clone(),
                    reason: Some(format!("parent pipeline {} canceled", pe.id)),
                }
                .into()
            })
            .collect();

        match execution.parent_step_execution(&pe.id)? {
            Some(parent_se) => {
                let reason = e.reason.clone().unwrap_or_else(|| "canceled".to_string());
                commands.push(
                    StepPipelineFinish {
                        pipeline_execution_id: parent_se.pipeline_execution_id.clone(),
                        step_execution_id: parent_se.id.clone(),
                        child_pipeline_execution_id: pe.id.clone(),
                        output: Map::new(),
                        errors: vec![StepError::new(ERROR_CODE_CANCELED, reason)],
                    }
                    .into(),
                );
                Ok(Reaction::commands(commands))
            }
            None => {
                let mut reaction = self.settle_root(execution, pe).await?;
                reaction.messages = commands.into_iter().map(Message::Command).collect();
                Ok(reaction)
            }
        }
    }

    async fn settle_root(&self, execution: &Execution, pe: &PipelineExecution) -> Result<Reaction, DispatchError> {
        let path = self.inner.store.write_snapshot(execution).await?;
        debug!(path = %path.display(), "Snapshot written");

        Ok(Reaction {
            completion: Some(Completion {
                execution_id: execution.id.clone(),
                pipeline_execution_id: pe.id.clone(),
                status: pe.status,
                output: pe.pipeline_output.clone(),
            }),
            ..Default::default()
        })
    }

    // ------------------------------------------------------------------
    // Step runners
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(execution_id = %run.execution_id, step = %run.step.name, step_execution_id = %run.step_execution_id))]
    async fn run_step(&self, run: StepRun) {
        if run.delay_ms > 0 {
            debug!(delay_ms = run.delay_ms, "Delaying step start");
            tokio::time::sleep(Duration::from_millis(run.delay_ms)).await;
        }

        let output = self
            .execute_runner(&run)
            .await
            .with_failure_mode(run.step.failure_mode);
        if output.has_errors() {
            warn!(errors = output.errors.len(), "Step reported errors");
        } else {
            info!("Step finished");
        }

        let (step_loop, step_retry) = planner::continuation(&run.step, run.step_loop, run.step_retry, &output);
        let finished = Envelope::event(
            run.execution_id.clone(),
            StepFinished {
                pipeline_execution_id: run.pipeline_execution_id.clone(),
                step_execution_id: run.step_execution_id.clone(),
                step_for_each: run.step_for_each.clone(),
                step_loop,
                step_retry,
                step_output: run.step.step_output(&output.output_variables),
                output: Some(output),
            },
        );

        if let Err(err) = self.submit(finished).await {
            error!(error = %err, "Failed to record step result");
        }
    }

    async fn execute_runner(&self, run: &StepRun) -> StepOutput {
        let Some(runner) = self.inner.runners.get(&run.step.step_type) else {
            return StepOutput::failed(vec![StepError::internal(format!(
                "no runner for step type '{}'",
                run.step.step_type
            ))]);
        };

        let mut input = run.input.clone();
        if !run.step.credentials.is_empty() {
            let mut resolved = Map::new();
            for name in &run.step.credentials {
                match self.inner.credentials.resolve(name).await {
                    Ok(value) => {
                        resolved.insert(name.clone(), Value::String(value));
                    }
                    Err(err) => return StepOutput::failed(vec![StepError::execution(err.to_string())]),
                }
            }
            input.insert("credentials".to_string(), Value::Object(resolved));
        }

        if let Err(err) = runner.validate(&input) {
            return StepOutput::failed(vec![err]);
        }

        let timeout = run.step.timeout(self.inner.settings.step_timeout.as_secs());
        let started_at = chrono::Utc::now();
        let result = tokio::spawn(async move { runner.run(&input, timeout).await }).await;

        match result {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => StepOutput::failed(vec![err]).with_times(started_at, chrono::Utc::now()),
            Err(join) => {
                let message = if join.is_panic() {
                    panic_message(join.into_panic())
                } else {
                    join.to_string()
                };
                StepOutput::failed(vec![StepError::internal(format!("step runner panicked: {}", message))])
            }
        }
    }
}

/// Pipeline execution that should fail when handling `message` fails
fn fail_target(message: &Message) -> String {
    match message {
        Message::Command(Command::PipelineQueue(c)) => c
            .parent_execution_id
            .clone()
            .unwrap_or_else(|| c.pipeline_execution_id.clone()),
        other => other.pipeline_execution_id().to_string(),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
