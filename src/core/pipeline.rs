//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML and consist of named steps. Steps run as
//! soon as every step they depend on is complete; a step may fan out over
//! a list (`for_each`), repeat itself (`loop`) or be retried (`retry`).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::domain::{FailureMode, StepForEach};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (used in CLI and by `pipeline` steps)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Default values for pipeline arguments
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Steps of the pipeline; order only matters for display
    pub steps: Vec<StepDefinition>,

    /// Output template: output name -> `<step>.<path>`
    #[serde(default)]
    pub output: Map<String, Value>,
}

impl PipelineDefinition {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }
            if !seen.insert(step.name.as_str()) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }
            if step.step_type == "pipeline" && step.pipeline.is_none() {
                anyhow::bail!("Step '{}' is a pipeline step without a 'pipeline' name", step.name);
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if self.get_step(dep).is_none() {
                    anyhow::bail!("Step '{}' depends on non-existent step '{}'", step.name, dep);
                }
            }
        }

        self.check_acyclic()?;

        for (name, path) in &self.output {
            let Some(path) = path.as_str() else {
                anyhow::bail!("Output '{}' must be a '<step>.<path>' string", name);
            };
            let step = path.split('.').next().unwrap_or_default();
            if self.get_step(step).is_none() {
                anyhow::bail!("Output '{}' references non-existent step '{}'", name, step);
            }
        }

        Ok(())
    }

    fn check_acyclic(&self) -> Result<()> {
        // Kahn's algorithm over depends_on edges
        let mut remaining: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.len()))
            .collect();
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut visited = 0;

        while let Some(name) = ready.pop() {
            visited += 1;
            for step in &self.steps {
                let edges = step.depends_on.iter().filter(|d| *d == name).count();
                if edges == 0 {
                    continue;
                }
                if let Some(n) = remaining.get_mut(step.name.as_str()) {
                    *n -= edges;
                    if *n == 0 {
                        ready.push(step.name.as_str());
                    }
                }
            }
        }

        if visited != self.steps.len() {
            anyhow::bail!("Pipeline '{}' has a dependency cycle", self.name);
        }
        Ok(())
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Pipeline arguments with declared defaults filled in
    pub fn resolve_args(&self, args: &Map<String, Value>) -> Map<String, Value> {
        let mut resolved = self.params.clone();
        for (k, v) in args {
            resolved.insert(k.clone(), v.clone());
        }
        resolved
    }

    /// Render the output template against collected step outputs.
    ///
    /// Returns the name of the first output whose path cannot be resolved.
    pub fn render_output(&self, step_outputs: &Map<String, Value>) -> std::result::Result<Map<String, Value>, String> {
        let mut rendered = Map::new();
        for (name, path) in &self.output {
            let value = path
                .as_str()
                .and_then(|p| lookup(step_outputs, p))
                .ok_or_else(|| name.clone())?;
            rendered.insert(name.clone(), value);
        }
        Ok(rendered)
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name (unique within pipeline)
    pub name: String,

    /// Step type: `http`, `exec`, `pipeline`, `sleep`, ...
    #[serde(rename = "type")]
    pub step_type: String,

    /// Steps that must complete before this one is planned
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Runner input
    #[serde(default)]
    pub input: Map<String, Value>,

    /// Fan-out source
    pub for_each: Option<ForEachSource>,

    #[serde(rename = "loop")]
    pub loop_config: Option<LoopConfig>,

    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Credential names resolved and injected under `credentials`
    #[serde(default)]
    pub credentials: Vec<String>,

    /// Child pipeline name (`pipeline` steps)
    pub pipeline: Option<String>,

    /// Child pipeline arguments (`pipeline` steps)
    #[serde(default)]
    pub args: Map<String, Value>,

    /// Named sub-outputs: name -> path into this step's output variables
    #[serde(default)]
    pub output: Map<String, Value>,

    /// Override timeout for this step (uses engine.step_timeout_seconds if not set)
    pub timeout_seconds: Option<u64>,
}

impl StepDefinition {
    /// Get the effective timeout for this step
    pub fn timeout(&self, default_seconds: u64) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(default_seconds))
    }

    pub fn is_for_each(&self) -> bool {
        self.for_each.is_some()
    }

    /// Resolve the named sub-outputs against a runner's output variables
    pub fn step_output(&self, output_variables: &Map<String, Value>) -> Map<String, Value> {
        self.output
            .iter()
            .filter_map(|(name, path)| {
                let value = lookup(output_variables, path.as_str()?)?;
                Some((name.clone(), value))
            })
            .collect()
    }
}

/// Where the items of a `for_each` come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForEachSource {
    /// Path into pipeline data, e.g. `args.hosts` or `list.stdout_lines`
    Path(String),

    /// Literal list or map
    Items(Value),
}

impl ForEachSource {
    /// Expand into keyed items. Lists are keyed by index, maps by key.
    pub fn resolve(&self, pipeline_data: &Map<String, Value>) -> std::result::Result<Vec<StepForEach>, String> {
        let value = match self {
            Self::Path(path) => {
                lookup(pipeline_data, path).ok_or_else(|| format!("for_each path '{}' did not resolve", path))?
            }
            Self::Items(value) => value.clone(),
        };

        match value {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items
                .into_iter()
                .enumerate()
                .map(|(i, v)| StepForEach::new(i.to_string(), v))
                .collect()),
            Value::Object(map) => Ok(map.into_iter().map(|(k, v)| StepForEach::new(k, v)).collect()),
            other => Err(format!("for_each must be a list or a map, got {}", other)),
        }
    }
}

/// Repeat a step until a condition holds or the iteration budget runs out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Total number of iterations allowed (including the first)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Output variable that ends the loop when truthy
    pub until: Option<String>,
}

fn default_max_iterations() -> u32 {
    1
}

impl LoopConfig {
    /// Whether the attempt at `iteration` (zero-based) ends the loop
    pub fn is_completed(&self, iteration: u32, output_variables: &Map<String, Value>) -> bool {
        if iteration + 1 >= self.max_iterations {
            return true;
        }
        match &self.until {
            Some(var) => lookup(output_variables, var).map(|v| is_truthy(&v)).unwrap_or(false),
            None => false,
        }
    }
}

/// Backoff schedule for re-attempting a fatally failed step.
///
/// Unset fields fall back to 3 attempts, 1s initial delay doubling up to 30s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(scaled.min(self.max_delay_ms as f64) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Resolve a dotted path (`a.b.0.c`) inside a JSON map
pub fn lookup(data: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current.clone())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ============================================================================
// Definition providers
// ============================================================================

/// Source of pipeline definitions
pub trait DefinitionProvider: Send + Sync {
    /// Look up a definition by pipeline name
    fn pipeline(&self, name: &str) -> Option<Arc<PipelineDefinition>>;

    /// Names of all known pipelines
    fn names(&self) -> Vec<String>;
}

/// Definitions held in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryDefinitions {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition after validating it
    pub fn insert(&mut self, definition: PipelineDefinition) -> Result<()> {
        definition
            .validate()
            .with_context(|| format!("Invalid pipeline '{}'", definition.name))?;
        self.pipelines.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Load every `*.yaml` / `*.yml` file in a directory
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut definitions = Self::new();
        if !dir.exists() {
            warn!(dir = %dir.display(), "Pipeline directory does not exist");
            return Ok(definitions);
        }

        for ext in ["yaml", "yml"] {
            let pattern = dir.join(format!("*.{}", ext));
            let pattern = pattern.to_string_lossy();
            for entry in glob::glob(&pattern).context("Invalid pipeline glob pattern")? {
                let path = entry.context("Failed to read pipeline directory entry")?;
                let definition = PipelineDefinition::from_file(&path)?;
                debug!(name = %definition.name, path = %path.display(), "Loaded pipeline");
                definitions
                    .insert(definition)
                    .with_context(|| format!("In file {}", path.display()))?;
            }
        }

        Ok(definitions)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl DefinitionProvider for InMemoryDefinitions {
    fn pipeline(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.pipelines.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const TEST_PIPELINE_YAML: &str = r#"
name: sample
description: Exec then fan out over http

params:
  greeting: hello

steps:
  - name: first
    type: exec
    input:
      command: echo hi

  - name: second
    type: http
    depends_on: [first]
    for_each: ["x", "y"]
    retry:
      max_attempts: 2
    failure_mode: ignored

output:
  code: first.exit_code
"#;

    #[test]
    fn test_pipeline_parsing() {
        let pipeline = PipelineDefinition::from_yaml(TEST_PIPELINE_YAML).unwrap();
        let names: Vec<&str> = pipeline.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        let second = pipeline.get_step("second").unwrap();
        assert_eq!(second.step_type, "http");
        assert_eq!(second.depends_on, vec!["first".to_string()]);
        assert_eq!(second.failure_mode, FailureMode::Ignored);
        assert_eq!(second.retry.as_ref().unwrap().max_attempts, 2);
        assert!(second.is_for_each());
    }

    #[test]
    fn test_sample_pipeline_is_valid() {
        PipelineDefinition::from_yaml(TEST_PIPELINE_YAML).unwrap().validate().unwrap();
    }

    #[test]
    fn test_invalid_dependency() {
        let yaml = r#"
name: invalid
steps:
  - name: first
    type: exec
    depends_on: [nonexistent]
"#;
        let pipeline = PipelineDefinition::from_yaml(yaml).unwrap();
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let yaml = r#"
name: cyclic
steps:
  - name: a
    type: exec
    depends_on: [b]
  - name: b
    type: exec
    depends_on: [a]
"#;
        let pipeline = PipelineDefinition::from_yaml(yaml).unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy: RetryPolicy = serde_yaml::from_str("initial_delay_ms: 250\nmax_delay_ms: 700").unwrap();
        assert_eq!(policy.max_attempts, 3);

        let delays: Vec<u64> = (1..=4).map(|n| policy.delay_for_attempt(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 700, 700]);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_for_each_keys() {
        let data = json!({"args": {"hosts": {"web": 1, "db": 2}}});
        let data = data.as_object().unwrap();

        let items = ForEachSource::Items(json!(["x", "y", "z"])).resolve(data).unwrap();
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["0", "1", "2"]);

        let items = ForEachSource::Path("args.hosts".to_string()).resolve(data).unwrap();
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["db", "web"]);

        assert!(ForEachSource::Items(Value::Null).resolve(data).unwrap().is_empty());
        assert!(ForEachSource::Items(json!(5)).resolve(data).is_err());
        assert!(ForEachSource::Path("args.missing".to_string()).resolve(data).is_err());
    }

    #[test]
    fn test_loop_completion() {
        let config = LoopConfig {
            max_iterations: 3,
            until: Some("done".to_string()),
        };
        let not_done = json!({"done": false});
        let done = json!({"done": true});

        assert!(!config.is_completed(0, not_done.as_object().unwrap()));
        assert!(config.is_completed(0, done.as_object().unwrap()));
        assert!(config.is_completed(2, not_done.as_object().unwrap()));
    }

    #[test]
    fn test_render_output() {
        let pipeline = PipelineDefinition::from_yaml(TEST_PIPELINE_YAML).unwrap();
        let outputs = json!({"first": {"exit_code": 0}});
        let rendered = pipeline.render_output(outputs.as_object().unwrap()).unwrap();
        assert_eq!(rendered.get("code"), Some(&json!(0)));

        let missing = pipeline.render_output(&Map::new()).unwrap_err();
        assert_eq!(missing, "code");
    }

    #[test]
    fn test_resolve_args_fills_defaults() {
        let pipeline = PipelineDefinition::from_yaml(TEST_PIPELINE_YAML).unwrap();
        let mut args = Map::new();
        args.insert("other".to_string(), json!(1));
        let resolved = pipeline.resolve_args(&args);
        assert_eq!(resolved.get("greeting"), Some(&json!("hello")));
        assert_eq!(resolved.get("other"), Some(&json!(1)));
    }

    #[test]
    fn test_load_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("test.yaml"), TEST_PIPELINE_YAML).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let definitions = InMemoryDefinitions::load_dir(temp.path()).unwrap();
        assert_eq!(definitions.names(), vec!["test".to_string()]);
        assert!(definitions.pipeline("test").is_some());
        assert!(definitions.pipeline("other").is_none());
    }
}
