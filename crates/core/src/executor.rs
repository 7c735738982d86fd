//! Workflow executor contract and a subprocess-backed implementation.
//!
//! Workflow-graph semantics and checkpointing live entirely behind
//! [`WorkflowExecutor`]. Robots only see `execute(...) -> outcome`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default wall-clock bound for a single execution.
pub const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(3600);

/// Result reported by an executor for one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Error text for a failed outcome, with a fallback when the executor
    /// reported failure without a message.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "Workflow reported failure without an error message".to_string())
    }
}

/// Errors raised around an executor call. The agent converts every
/// variant into a failed job.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to start executor: {0}")]
    Spawn(String),

    #[error("Executor timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Executor exited with code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error("Executor produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract for the external durable workflow engine.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Run `workflow_definition` to completion.
    async fn execute(
        &self,
        workflow_definition: &serde_json::Value,
        workflow_id: &str,
        initial_variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}

/// JSON document written to the executor process's stdin.
#[derive(Debug, Serialize)]
struct ExecutorInput<'a> {
    workflow_id: &'a str,
    workflow: &'a serde_json::Value,
    variables: &'a serde_json::Map<String, serde_json::Value>,
}

/// Runs an external program per job.
///
/// The program receives `{workflow_id, workflow, variables}` on stdin
/// and must print `{success, result | error}` as JSON on stdout. The
/// process is killed if it outlives `timeout`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_EXECUTOR_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Split a command line on whitespace into program and arguments.
    ///
    /// Returns `None` for an empty command line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl WorkflowExecutor for CommandExecutor {
    async fn execute(
        &self,
        workflow_definition: &serde_json::Value,
        workflow_id: &str,
        initial_variables: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let input = serde_json::to_vec(&ExecutorInput {
            workflow_id,
            workflow: workflow_definition,
            variables: initial_variables,
        })
        .map_err(|e| ExecutorError::InvalidOutput(format!("Cannot encode input: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // The program may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
            // Closing stdin signals end of input.
            drop(stdin);
        }

        tracing::debug!(workflow_id, program = %self.program, "Executor process started");

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutorError::Timeout {
                secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Failed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_outcome(&stdout)
    }
}

/// Parse the last non-empty stdout line as an [`ExecutionOutcome`].
///
/// Executors may log freely before the final line.
fn parse_outcome(stdout: &str) -> Result<ExecutionOutcome, ExecutorError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ExecutorError::InvalidOutput("empty stdout".to_string()))?;
    serde_json::from_str(line).map_err(|e| ExecutorError::InvalidOutput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_outcome_uses_last_line() {
        let out = "starting\nstep 1\n{\"success\":true,\"result\":{\"rows\":3}}\n\n";
        let outcome = parse_outcome(out).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(serde_json::json!({"rows": 3})));
    }

    #[test]
    fn parse_outcome_rejects_empty_and_garbage() {
        assert_matches!(parse_outcome("   \n"), Err(ExecutorError::InvalidOutput(_)));
        assert_matches!(parse_outcome("done"), Err(ExecutorError::InvalidOutput(_)));
    }

    #[test]
    fn failed_outcome_without_message_has_fallback() {
        let outcome = ExecutionOutcome {
            success: false,
            result: None,
            error: None,
        };
        assert!(outcome.error_message().contains("without an error message"));
        assert_eq!(ExecutionOutcome::failed("boom").error_message(), "boom");
    }

    #[test]
    fn command_line_splitting() {
        let exec = CommandExecutor::from_command_line("python3 -m runner --quiet").unwrap();
        assert_eq!(exec.program(), "python3");
        assert_eq!(exec.args, vec!["-m", "runner", "--quiet"]);
        assert!(CommandExecutor::from_command_line("   ").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_reads_stdin_and_reports_outcome() {
        let exec = CommandExecutor::new(
            "sh",
            vec![
                "-c".into(),
                r#"read input; echo "{\"success\":true,\"result\":$input}""#.into(),
            ],
        );
        let mut vars = serde_json::Map::new();
        vars.insert("customer".into(), serde_json::json!("acme"));

        let outcome = exec
            .execute(&serde_json::json!({"nodes": []}), "wf-1", &vars)
            .await
            .unwrap();

        assert!(outcome.success);
        let echoed = outcome.result.unwrap();
        assert_eq!(echoed["workflow_id"], "wf-1");
        assert_eq!(echoed["variables"]["customer"], "acme");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported_with_stderr() {
        let exec = CommandExecutor::new("sh", vec!["-c".into(), "cat >/dev/null; echo broken >&2; exit 3".into()]);
        let err = exec
            .execute(&serde_json::json!({}), "wf", &serde_json::Map::new())
            .await
            .unwrap_err();
        assert_matches!(err, ExecutorError::Failed { exit_code: 3, ref stderr } if stderr == "broken");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_process_times_out() {
        let exec = CommandExecutor::new("sh", vec!["-c".into(), "sleep 5".into()])
            .with_timeout(Duration::from_millis(100));
        let err = exec
            .execute(&serde_json::json!({}), "wf", &serde_json::Map::new())
            .await
            .unwrap_err();
        assert_matches!(err, ExecutorError::Timeout { .. });
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let exec = CommandExecutor::new("/nonexistent/fleet-executor", vec![]);
        let err = exec
            .execute(&serde_json::json!({}), "wf", &serde_json::Map::new())
            .await
            .unwrap_err();
        assert_matches!(err, ExecutorError::Spawn(_));
    }
}
