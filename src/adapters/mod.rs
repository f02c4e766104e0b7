//! Step runners for external systems.
//!
//! A step runner executes one step type (an HTTP request, a shell command)
//! outside the execution lock. Failures come back as [`StepError`] values
//! and never as panics.

pub mod exec;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{StepError, StepInput, StepOutput};

// Re-export the built-in runners
pub use exec::ExecRunner;
pub use http::HttpRunner;

/// Contract every runnable step type satisfies
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Step type handled by this runner (`http`, `exec`, ...)
    fn step_type(&self) -> &str;

    /// Check the input before running
    fn validate(&self, input: &StepInput) -> Result<(), StepError>;

    /// Run the step. An `Ok` output may still carry errors (e.g. an HTTP
    /// error status) alongside its output variables.
    async fn run(&self, input: &StepInput, timeout: Duration) -> Result<StepOutput, StepError>;
}

/// Runners keyed by step type
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn StepRunner>>,
}

impl RunnerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `http` and `exec` runners
    pub fn with_defaults(http_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpRunner::new(http_timeout)));
        registry.register(Arc::new(ExecRunner::new()));
        registry
    }

    /// Add or replace the runner for its step type
    pub fn register(&mut self, runner: Arc<dyn StepRunner>) {
        self.runners.insert(runner.step_type().to_string(), runner);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepRunner>> {
        self.runners.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.runners.contains_key(step_type)
    }
}

/// Read a required string field from step input
pub(crate) fn required_str<'a>(input: &'a StepInput, field: &str) -> Result<&'a str, StepError> {
    match input.get(field).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(StepError::new(
            crate::domain::errors::ERROR_CODE_BAD_REQUEST,
            format!("missing required field '{}'", field),
        )),
    }
}
