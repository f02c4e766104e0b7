//! Shell command runner.
//!
//! Runs `sh -c <command>` and reports the exit code together with stdout
//! and stderr, both as whole strings and split into lines.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{required_str, StepRunner};
use crate::domain::{StepError, StepInput, StepOutput};

const SHELL: &str = "sh";

/// Runner for `exec` steps
#[derive(Debug, Default, Clone)]
pub struct ExecRunner;

impl ExecRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepRunner for ExecRunner {
    fn step_type(&self) -> &str {
        "exec"
    }

    fn validate(&self, input: &StepInput) -> Result<(), StepError> {
        required_str(input, "command")?;
        if let Some(env) = input.get("env") {
            if !env.is_object() {
                return Err(StepError::new(
                    crate::domain::errors::ERROR_CODE_BAD_REQUEST,
                    "'env' must be a map",
                ));
            }
        }
        Ok(())
    }

    async fn run(&self, input: &StepInput, step_timeout: Duration) -> Result<StepOutput, StepError> {
        let command = required_str(input, "command")?;
        let started_at = Utc::now();

        let mut cmd = Command::new(SHELL);
        cmd.args(["-c", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = input.get("dir").and_then(Value::as_str) {
            cmd.current_dir(dir);
        }
        if let Some(Value::Object(env)) = input.get("env") {
            for (key, value) in env {
                let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                cmd.env(key, value);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| StepError::execution(format!("Failed to spawn '{}': {}", command, e)))?;

        // Fed from its own task so the timeout also covers a child that never reads
        let stdin = child.stdin.take();
        let data = input.get("stdin").and_then(Value::as_str).map(str::to_string);
        let feeder = tokio::spawn(async move {
            let (Some(mut stdin), Some(data)) = (stdin, data) else {
                return;
            };
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                debug!(error = %e, "Command closed stdin early");
            }
        });

        let waited = timeout(step_timeout, child.wait_with_output()).await;
        feeder.abort();
        let output = waited
            .map_err(|_| StepError::execution(format!("Command timed out after {:?}", step_timeout)))?
            .map_err(|e| StepError::execution(format!("Failed to wait for command: {}", e)))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(exit_code, "Command finished");

        let mut vars = Map::new();
        vars.insert("exit_code".to_string(), Value::from(exit_code));
        vars.insert("stdout_lines".to_string(), lines(&stdout));
        vars.insert("stderr_lines".to_string(), lines(&stderr));
        vars.insert("stdout".to_string(), Value::from(stdout));
        vars.insert("stderr".to_string(), Value::String(stderr.clone()));

        let mut step_output = StepOutput::finished(vars).with_times(started_at, Utc::now());
        if !output.status.success() {
            step_output = StepOutput {
                errors: vec![StepError::execution(format!(
                    "Command failed with exit code {}: {}",
                    exit_code,
                    stderr.trim()
                ))],
                status: crate::domain::StepExecutionStatus::Failed,
                ..step_output
            };
        }

        Ok(step_output)
    }
}

fn lines(text: &str) -> Value {
    Value::Array(text.lines().map(|l| Value::from(l.to_string())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(command: &str) -> StepInput {
        let mut input = Map::new();
        input.insert("command".to_string(), json!(command));
        input
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let runner = ExecRunner::new();
        let output = runner
            .run(&input("echo one; echo two"), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!output.has_errors());
        assert_eq!(output.get("exit_code"), Some(&json!(0)));
        assert_eq!(output.get("stdout_lines"), Some(&json!(["one", "two"])));
        assert!(output.started_at.is_some());
    }

    #[tokio::test]
    async fn test_exec_non_zero_exit_is_error() {
        let runner = ExecRunner::new();
        let output = runner
            .run(&input("echo bad >&2; exit 3"), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(output.has_errors());
        assert_eq!(output.get("exit_code"), Some(&json!(3)));
        assert_eq!(output.get("stderr_lines"), Some(&json!(["bad"])));
    }

    #[tokio::test]
    async fn test_exec_env_and_timeout() {
        let runner = ExecRunner::new();
        let mut with_env = input("echo $GREETING");
        with_env.insert("env".to_string(), json!({"GREETING": "hi"}));
        let output = runner.run(&with_env, Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.get("stdout_lines"), Some(&json!(["hi"])));

        let err = runner
            .run(&input("sleep 5"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_exec_stdin_is_passed() {
        let runner = ExecRunner::new();
        let mut piped = input("tr a-z A-Z");
        piped.insert("stdin".to_string(), json!("quiet"));
        let output = runner.run(&piped, Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.get("stdout_lines"), Some(&json!(["QUIET"])));
    }

    #[tokio::test]
    async fn test_exec_timeout_covers_unread_stdin() {
        let runner = ExecRunner::new();
        let mut stuck = input("sleep 5");
        // Larger than a pipe buffer, so writing blocks until the child exits
        stuck.insert("stdin".to_string(), json!("x".repeat(1 << 20)));

        let started = std::time::Instant::now();
        let err = runner.run(&stuck, Duration::from_millis(200)).await.unwrap_err();
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_exec_validate() {
        let runner = ExecRunner::new();
        assert!(runner.validate(&input("true")).is_ok());
        assert!(runner.validate(&Map::new()).is_err());
    }
}
