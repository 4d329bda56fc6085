use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::command::CommandSpec;

/// One test invocation targeting a single backend configuration.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub label: String,
    pub command: CommandSpec,
    /// Exit code that counts as a pass. Normally 0.
    pub expected_exit_code: i32,
    /// Per-job timeout; overrides the run-level default when set.
    pub timeout: Option<Duration>,
}

impl JobSpec {
    pub fn new(label: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            label: label.into(),
            command,
            expected_exit_code: 0,
            timeout: None,
        }
    }
}

/// Recorded outcome of one job execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub job_label: String,
    /// Exit code, `None` when the job was killed (signal or timeout).
    pub exit_code: Option<i32>,
    #[serde(rename = "durationSecs", serialize_with = "crate::models::time_serde::secs")]
    pub duration: Duration,
    pub succeeded: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
}
