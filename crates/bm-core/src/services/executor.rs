use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::models::{CommandSpec, ExecOutput};

/// The sole I/O surface the orchestrator depends on. Tests inject fakes
/// that simulate success, failure, and slow commands without spawning.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<ExecOutput>;
}

/// Executes commands as real child processes with captured output.
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // The caller may drop this future on a timeout or cancellation;
        // the child must not outlive it.
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            OrchestratorError::Process(format!("failed to start {}: {e}", spec.program))
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello"]);
        let output = ProcessExecutor.run(&spec).await.unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.success());
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let spec = CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 7"]);
        let output = ProcessExecutor.run(&spec).await.unwrap();
        assert_eq!(output.exit_code, Some(7));
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn applies_env_overrides() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo $MATRIX_BACKEND"])
            .env("MATRIX_BACKEND", "postgres");
        let output = ProcessExecutor.run(&spec).await.unwrap();
        assert_eq!(output.stdout.trim(), "postgres");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-bm");
        let err = ProcessExecutor.run(&spec).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Process(_)));
    }
}
