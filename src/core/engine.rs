//! Engine facade.
//!
//! Wires the event store, definitions, runners and credentials into a
//! dispatcher and exposes the operations front ends need: start a
//! pipeline, wait for it, inspect it and steer it (cancel, pause, resume).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::adapters::RunnerRegistry;
use crate::config::ResolvedConfig;
use crate::domain::events::{PipelineCancel, PipelinePause, PipelineQueue, PipelineResume};
use crate::domain::ids::{new_execution_id, new_pipeline_execution_id};
use crate::domain::{Envelope, Execution, LogEntry, PipelineStatus};

use super::credentials::{CachedCredentialProvider, CredentialProvider, EnvCredentialProvider};
use super::dispatch::{Completion, DispatchSettings, Dispatcher};
use super::event_store::EventStore;
use super::pipeline::{DefinitionProvider, InMemoryDefinitions};

/// Ids of a newly started execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedExecution {
    pub execution_id: String,
    pub pipeline_execution_id: String,
}

/// One row of the execution listing
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub pipeline_execution_id: String,
    pub pipeline: String,
    pub status: PipelineStatus,
    pub steps_complete: usize,
    pub steps_total: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    store: EventStore,
    definitions: Arc<dyn DefinitionProvider>,
    runners: RunnerRegistry,
    credentials: Arc<dyn CredentialProvider>,
    settings: DispatchSettings,
}

impl EngineBuilder {
    pub fn runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = runners;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.settings.step_timeout = timeout;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            dispatcher: Dispatcher::new(
                self.store,
                self.definitions,
                self.runners,
                self.credentials,
                self.settings,
            ),
        }
    }
}

/// Durable pipeline engine
#[derive(Clone)]
pub struct Engine {
    dispatcher: Dispatcher,
}

impl Engine {
    /// Start building an engine over a store and a set of definitions
    pub fn builder(store: EventStore, definitions: Arc<dyn DefinitionProvider>) -> EngineBuilder {
        EngineBuilder {
            store,
            definitions,
            runners: RunnerRegistry::with_defaults(Duration::from_millis(3000)),
            credentials: Arc::new(EnvCredentialProvider),
            settings: DispatchSettings::default(),
        }
    }

    /// Engine configured from resolved configuration
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let definitions = InMemoryDefinitions::load_dir(&config.pipelines)
            .with_context(|| format!("Failed to load pipelines from {}", config.pipelines.display()))?;
        let credentials = CachedCredentialProvider::new(Arc::new(EnvCredentialProvider), config.engine.credential_ttl());

        Ok(Self::builder(EventStore::new(config.executions_dir()), Arc::new(definitions))
            .runners(RunnerRegistry::with_defaults(config.engine.http_timeout()))
            .credentials(Arc::new(credentials))
            .step_timeout(config.engine.step_timeout())
            .build())
    }

    pub fn store(&self) -> &EventStore {
        self.dispatcher.store()
    }

    /// Names of all known pipelines
    pub fn pipelines(&self) -> Vec<String> {
        self.dispatcher.definitions().names()
    }

    /// Receive a notice whenever a root pipeline settles
    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.dispatcher.subscribe()
    }

    /// Queue a new root pipeline execution
    #[instrument(skip(self, args))]
    pub async fn start(&self, pipeline: &str, args: Map<String, Value>) -> Result<StartedExecution> {
        let definition = self
            .dispatcher
            .definitions()
            .pipeline(pipeline)
            .with_context(|| format!("Pipeline not found: {}", pipeline))?;

        let started = StartedExecution {
            execution_id: new_execution_id(),
            pipeline_execution_id: new_pipeline_execution_id(),
        };

        self.dispatcher
            .submit(Envelope::command(
                started.execution_id.clone(),
                PipelineQueue {
                    pipeline_execution_id: started.pipeline_execution_id.clone(),
                    name: definition.name.clone(),
                    args: definition.resolve_args(&args),
                    parent_execution_id: None,
                    parent_step_execution_id: None,
                },
            ))
            .await
            .context("Failed to queue pipeline")?;

        info!(execution_id = %started.execution_id, "Pipeline queued");
        Ok(started)
    }

    /// Start a pipeline and wait for its root to settle
    pub async fn run(&self, pipeline: &str, args: Map<String, Value>, timeout: Duration) -> Result<Completion> {
        let receiver = self.subscribe();
        let started = self.start(pipeline, args).await?;
        self.wait_with(receiver, &started.execution_id, timeout).await
    }

    /// Wait until the root pipeline of an execution settles
    pub async fn wait(&self, execution_id: &str, timeout: Duration) -> Result<Completion> {
        let receiver = self.subscribe();
        self.wait_with(receiver, execution_id, timeout).await
    }

    async fn wait_with(
        &self,
        mut receiver: broadcast::Receiver<Completion>,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<Completion> {
        let wait = async {
            loop {
                if let Some(completion) = self.settled(execution_id).await? {
                    return Ok(completion);
                }
                match receiver.recv().await {
                    Ok(completion) if completion.execution_id == execution_id => return Ok(completion),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Completion receiver lagged, re-checking log");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("Engine shut down while waiting for {}", execution_id)
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .with_context(|| format!("Timed out after {:?} waiting for {}", timeout, execution_id))?
    }

    /// Completion notice for an execution whose root already settled
    async fn settled(&self, execution_id: &str) -> Result<Option<Completion>> {
        if !self.store().exists(execution_id) {
            return Ok(None);
        }
        let execution = self.dispatcher.load(execution_id).await?;
        Ok(execution.root().filter(|pe| pe.is_terminal()).map(|pe| Completion {
            execution_id: execution.id.clone(),
            pipeline_execution_id: pe.id.clone(),
            status: pe.status,
            output: pe.pipeline_output.clone(),
        }))
    }

    /// Summaries of every execution in the store, oldest id first
    pub async fn list_executions(&self) -> Result<Vec<ExecutionSummary>> {
        let mut summaries = Vec::new();
        for id in self.store().list_executions().await? {
            let execution = match self.dispatcher.load(&id).await {
                Ok(execution) => execution,
                Err(err) => {
                    warn!(execution_id = %id, error = %err, "Skipping unreadable execution");
                    continue;
                }
            };
            let Some(root) = execution.root() else {
                continue;
            };
            let (steps_complete, steps_total) = root.progress_summary();
            summaries.push(ExecutionSummary {
                execution_id: execution.id.clone(),
                pipeline_execution_id: root.id.clone(),
                pipeline: root.name.clone(),
                status: root.status,
                steps_complete,
                steps_total,
                start_time: root.start_time,
                end_time: root.end_time,
            });
        }
        Ok(summaries)
    }

    /// Current aggregate of an execution
    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        self.dispatcher
            .load(execution_id)
            .await
            .with_context(|| format!("Failed to load execution {}", execution_id))
    }

    /// Cancel a pipeline execution (the root when none is given)
    pub async fn cancel(&self, execution_id: &str, pipeline_execution_id: Option<&str>, reason: Option<String>) -> Result<()> {
        let target = self.target(execution_id, pipeline_execution_id).await?;
        self.dispatcher
            .submit(Envelope::command(
                execution_id,
                PipelineCancel {
                    pipeline_execution_id: target,
                    reason,
                },
            ))
            .await
    }

    pub async fn pause(&self, execution_id: &str, pipeline_execution_id: Option<&str>) -> Result<()> {
        let target = self.target(execution_id, pipeline_execution_id).await?;
        self.dispatcher
            .submit(Envelope::command(
                execution_id,
                PipelinePause {
                    pipeline_execution_id: target,
                },
            ))
            .await
    }

    pub async fn resume(&self, execution_id: &str, pipeline_execution_id: Option<&str>) -> Result<()> {
        let target = self.target(execution_id, pipeline_execution_id).await?;
        self.dispatcher
            .submit(Envelope::command(
                execution_id,
                PipelineResume {
                    pipeline_execution_id: target,
                },
            ))
            .await
    }

    /// Raw ordered fact log
    pub async fn read_log(&self, execution_id: &str) -> Result<Vec<LogEntry>> {
        if !self.store().exists(execution_id) {
            anyhow::bail!("Execution not found: {}", execution_id);
        }
        self.store().replay(execution_id).await
    }

    /// Snapshot written when the root pipeline settled
    pub async fn read_snapshot(&self, execution_id: &str) -> Result<Option<Execution>> {
        self.store().read_snapshot(execution_id).await
    }

    async fn target(&self, execution_id: &str, pipeline_execution_id: Option<&str>) -> Result<String> {
        let execution = self.get_execution(execution_id).await?;
        match pipeline_execution_id {
            Some(id) => Ok(execution.pipeline_execution(id)?.id.clone()),
            None => execution
                .root()
                .map(|pe| pe.id.clone())
                .with_context(|| format!("Execution {} has no root pipeline", execution_id)),
        }
    }
}
