//! Command-line interface for pipewright.
//!
//! Provides commands for running pipelines, inspecting executions and
//! their fact logs, and steering executions (cancel, pause, resume).
//!
//! An execution is driven by the process that delivers its facts. `run`
//! and `resume` keep driving it in the foreground until the root pipeline
//! settles or the timeout expires.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use crate::config;
use crate::core::Engine;
use crate::domain::{Execution, LogEntry, PipelineExecution, PipelineStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// pipewright - Event-sourced pipeline execution engine
#[derive(Parser, Debug)]
#[command(name = "pipewright")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline and wait for it to settle
    Run {
        /// Pipeline name
        pipeline_name: String,

        /// Pipeline argument as key=value (value parsed as JSON when possible)
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// YAML or JSON file holding pipeline arguments
        #[arg(long)]
        args_file: Option<PathBuf>,

        /// Seconds to wait for the pipeline to settle
        #[arg(short, long, default_value = "3600")]
        timeout: u64,
    },

    /// Show the status of an execution
    Status {
        /// Execution ID (exec_...)
        execution_id: String,
    },

    /// List executions
    List {
        /// Maximum number of executions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Cancel a pipeline execution and its children
    Cancel {
        execution_id: String,

        /// Pipeline execution to cancel (defaults to the root)
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Reason recorded with the cancellation
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Pause a pipeline execution
    Pause {
        execution_id: String,

        /// Pipeline execution to pause (defaults to the root)
        #[arg(short, long)]
        pipeline: Option<String>,
    },

    /// Resume a paused pipeline execution and drive it to completion
    Resume {
        execution_id: String,

        /// Pipeline execution to resume (defaults to the root)
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Seconds to wait for the pipeline to settle
        #[arg(short, long, default_value = "3600")]
        timeout: u64,
    },

    /// Print the fact log of an execution
    Log {
        execution_id: String,

        /// Keep printing new facts until the root pipeline settles
        #[arg(short, long)]
        follow: bool,
    },

    /// Print the completion snapshot of an execution
    Snapshot {
        execution_id: String,
    },

    /// List known pipeline definitions
    Pipelines,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline_name,
                args,
                args_file,
                timeout,
            } => run_pipeline(&pipeline_name, &args, args_file, timeout).await,
            Commands::Status { execution_id } => show_status(&execution_id).await,
            Commands::List { limit } => list_executions(limit).await,
            Commands::Cancel {
                execution_id,
                pipeline,
                reason,
            } => cancel_execution(&execution_id, pipeline.as_deref(), reason).await,
            Commands::Pause { execution_id, pipeline } => pause_execution(&execution_id, pipeline.as_deref()).await,
            Commands::Resume {
                execution_id,
                pipeline,
                timeout,
            } => resume_execution(&execution_id, pipeline.as_deref(), timeout).await,
            Commands::Log { execution_id, follow } => show_log(&execution_id, follow).await,
            Commands::Snapshot { execution_id } => show_snapshot(&execution_id).await,
            Commands::Pipelines => list_pipelines().await,
            Commands::Config => show_config().await,
        }
    }
}

fn engine() -> Result<Engine> {
    Engine::from_config(config::config()?)
}

/// Build pipeline arguments from an optional file and `key=value` pairs
fn parse_args(pairs: &[String], file: Option<PathBuf>) -> Result<Map<String, Value>> {
    let mut args = match file {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read args file: {}", path.display()))?;
            let value: Value = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse args file: {}", path.display()))?;
            match value {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                _ => anyhow::bail!("Args file {} must contain a map", path.display()),
            }
        }
        None => Map::new(),
    };

    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Invalid argument '{}', expected KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        args.insert(key.trim().to_string(), value);
    }

    Ok(args)
}

/// Run a pipeline with the given arguments
async fn run_pipeline(pipeline_name: &str, pairs: &[String], args_file: Option<PathBuf>, timeout: u64) -> Result<()> {
    let args = parse_args(pairs, args_file)?;
    let engine = engine()?;

    let completion = engine
        .run(pipeline_name, args, Duration::from_secs(timeout))
        .await?;

    if let Some(output) = &completion.output {
        println!("{}", serde_json::to_string_pretty(output)?);
    }

    match completion.status {
        PipelineStatus::Finished => {
            eprintln!("\n[Execution {} finished]", completion.execution_id);
        }
        status => {
            eprintln!("\n[Execution {} {}]", completion.execution_id, status);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Show the status of an execution
async fn show_status(execution_id: &str) -> Result<()> {
    let engine = engine()?;
    let execution = engine.get_execution(execution_id).await?;

    println!("Execution ID: {}", execution.id);
    for pe in execution.pipeline_executions.values() {
        print_pipeline(&execution, pe);
    }

    Ok(())
}

fn print_pipeline(execution: &Execution, pe: &PipelineExecution) {
    let (done, total) = pe.progress_summary();
    println!();
    println!("Pipeline: {} ({})", pe.name, pe.id);
    if let Some(parent) = &pe.parent_execution_id {
        println!("  Parent: {}", parent);
    }
    println!("  Status: {}", pe.status);
    if let Some(started) = pe.start_time {
        println!("  Started: {}", started);
    }
    if let Some(ended) = pe.end_time {
        println!("  Ended: {}", ended);
    }
    println!("  Progress: {}/{}", done, total);

    if !pe.step_executions.is_empty() {
        println!("  Steps:");
        for se in pe.step_executions.values() {
            let key = se
                .step_for_each
                .as_ref()
                .map(|f| format!("[{}]", f.key))
                .unwrap_or_default();
            println!("    {}{} {}: {:?}", se.name, key, se.id, se.status);
        }
    }

    if !pe.errors.is_empty() {
        println!("  Errors:");
        for err in &pe.errors {
            println!("    {}", err);
        }
    }

    let children = execution.child_pipeline_executions(&pe.id).count();
    if children > 0 {
        println!("  Child pipelines: {}", children);
    }
}

/// List executions, newest first
async fn list_executions(limit: usize) -> Result<()> {
    let engine = engine()?;
    let mut summaries = engine.list_executions().await?;

    if summaries.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    summaries.sort_by(|a, b| b.start_time.cmp(&a.start_time));

    println!("{:<38} {:<20} {:<10} {:<8}", "EXECUTION ID", "PIPELINE", "STATUS", "STEPS");
    println!("{}", "-".repeat(80));

    for summary in summaries.iter().take(limit) {
        println!(
            "{:<38} {:<20} {:<10} {}/{}",
            summary.execution_id,
            summary.pipeline,
            summary.status.to_string(),
            summary.steps_complete,
            summary.steps_total
        );
    }

    Ok(())
}

/// Cancel a pipeline execution and wait for the cancellation to be recorded
async fn cancel_execution(execution_id: &str, pipeline: Option<&str>, reason: Option<String>) -> Result<()> {
    let engine = engine()?;
    engine.cancel(execution_id, pipeline, reason).await?;

    let execution = wait_for_status(&engine, execution_id, pipeline, PipelineStatus::is_terminal).await?;
    let pe = target(&execution, pipeline)?;
    eprintln!("[Pipeline {} {}]", pe.id, pe.status);
    Ok(())
}

async fn pause_execution(execution_id: &str, pipeline: Option<&str>) -> Result<()> {
    let engine = engine()?;
    engine.pause(execution_id, pipeline).await?;

    let execution = wait_for_status(&engine, execution_id, pipeline, |status| {
        status == PipelineStatus::Paused || status.is_terminal()
    })
    .await?;
    let pe = target(&execution, pipeline)?;
    eprintln!("[Pipeline {} {}]", pe.id, pe.status);
    Ok(())
}

async fn resume_execution(execution_id: &str, pipeline: Option<&str>, timeout: u64) -> Result<()> {
    let engine = engine()?;
    engine.resume(execution_id, pipeline).await?;

    let completion = engine.wait(execution_id, Duration::from_secs(timeout)).await?;
    if let Some(output) = &completion.output {
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    eprintln!("\n[Execution {} {}]", completion.execution_id, completion.status);
    if completion.status != PipelineStatus::Finished {
        std::process::exit(1);
    }
    Ok(())
}

/// Poll until the targeted pipeline execution satisfies `done`
async fn wait_for_status<F>(engine: &Engine, execution_id: &str, pipeline: Option<&str>, done: F) -> Result<Execution>
where
    F: Fn(PipelineStatus) -> bool,
{
    let poll = async {
        loop {
            let execution = engine.get_execution(execution_id).await?;
            if done(target(&execution, pipeline)?.status) {
                return Ok::<_, anyhow::Error>(execution);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(30), poll)
        .await
        .with_context(|| format!("Timed out waiting for {}", execution_id))?
}

fn target<'a>(execution: &'a Execution, pipeline: Option<&str>) -> Result<&'a PipelineExecution> {
    match pipeline {
        Some(id) => Ok(execution.pipeline_execution(id)?),
        None => execution
            .root()
            .with_context(|| format!("Execution {} has no root pipeline", execution.id)),
    }
}

/// Print the fact log, optionally following it until the root settles
async fn show_log(execution_id: &str, follow: bool) -> Result<()> {
    let engine = engine()?;
    let mut last_sequence = 0;

    loop {
        for entry in engine.read_log(execution_id).await? {
            if entry.sequence > last_sequence {
                print_entry(&entry);
                last_sequence = entry.sequence;
            }
        }

        if !follow {
            return Ok(());
        }

        let execution = engine.get_execution(execution_id).await?;
        if execution.is_complete() {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_entry(entry: &LogEntry) {
    println!(
        "{:>5} {} {:<34} {}",
        entry.sequence,
        entry.created_at.format("%H:%M:%S%.3f"),
        entry.fact_type,
        entry.payload
    );
}

async fn show_snapshot(execution_id: &str) -> Result<()> {
    let engine = engine()?;
    match engine.read_snapshot(execution_id).await? {
        Some(execution) => println!("{}", serde_json::to_string_pretty(&execution)?),
        None => anyhow::bail!("No snapshot for {} (root pipeline has not settled)", execution_id),
    }
    Ok(())
}

async fn list_pipelines() -> Result<()> {
    let engine = engine()?;
    let names = engine.pipelines();
    if names.is_empty() {
        println!("No pipelines found in {}", config::pipelines_dir()?.display());
        return Ok(());
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("pipewright configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Executions:          {}", cfg.executions_dir().display());
    println!("  Pipelines:           {}", cfg.pipelines.display());
    println!();
    println!("Engine:");
    println!("  Step timeout:    {}s", cfg.engine.step_timeout_seconds);
    println!("  HTTP timeout:    {}ms", cfg.engine.http_timeout_ms);
    println!("  Credential TTL:  {}s", cfg.engine.credential_ttl_seconds);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_args_pairs() {
        let args = parse_args(
            &["name=world".to_string(), "count=3".to_string(), "tags=[\"a\"]".to_string()],
            None,
        )
        .unwrap();

        assert_eq!(args.get("name"), Some(&json!("world")));
        assert_eq!(args.get("count"), Some(&json!(3)));
        assert_eq!(args.get("tags"), Some(&json!(["a"])));
    }

    #[test]
    fn test_parse_args_file_then_pairs() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "name: from-file\nregion: eu").unwrap();

        let args = parse_args(&["name=override".to_string()], Some(file.path().to_path_buf())).unwrap();
        assert_eq!(args.get("name"), Some(&json!("override")));
        assert_eq!(args.get("region"), Some(&json!("eu")));
    }

    #[test]
    fn test_parse_args_rejects_missing_equals() {
        assert!(parse_args(&["oops".to_string()], None).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["pipewright", "run", "hello", "--arg", "x=1", "-t", "5"]);
        match cli.command {
            Commands::Run {
                pipeline_name,
                args,
                timeout,
                ..
            } => {
                assert_eq!(pipeline_name, "hello");
                assert_eq!(args, vec!["x=1".to_string()]);
                assert_eq!(timeout, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
