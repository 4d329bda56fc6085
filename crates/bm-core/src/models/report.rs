use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

use super::job::RunResult;
use super::service::ServiceStatus;

/// Per-service outcome, reported regardless of how the run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub name: String,
    pub status: ServiceStatus,
    /// How long the readiness wait took, when the service became ready.
    #[serde(
        rename = "readyAfterSecs",
        serialize_with = "crate::models::time_serde::opt_secs"
    )]
    pub ready_after: Option<Duration>,
    pub probe_attempts: u32,
    /// First stdout line of the start command (e.g. a container id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceReport {
    pub fn unstarted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Unstarted,
            ready_after: None,
            probe_attempts: 0,
            handle: None,
            error: None,
        }
    }
}

/// A stop command that failed. Collected, never silently dropped, and
/// non-fatal to the job-level pass/fail determination by default.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownError {
    pub service: String,
    pub reason: String,
}

/// Why a run was aborted before (or while) jobs were executing. Job
/// failures are not represented here: a run with failing jobs is an
/// expected outcome, recorded in its `RunResult`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum RunFailure {
    ServiceStartFailed { service: String, reason: String },
    ServiceNotReady { service: String, last_error: String },
    Interrupted,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceStartFailed { service, reason } => {
                write!(f, "service '{service}' failed to start: {reason}")
            }
            Self::ServiceNotReady {
                service,
                last_error,
            } => {
                write!(f, "service '{service}' never became ready: {last_error}")
            }
            Self::Interrupted => write!(f, "run interrupted"),
        }
    }
}

/// Aggregate outcome of one orchestration run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub services: Vec<ServiceReport>,
    pub results: Vec<RunResult>,
    pub teardown_errors: Vec<TeardownError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub overall_success: bool,
}

impl RunReport {
    pub fn jobs_passed(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded).count()
    }

    pub fn jobs_failed(&self) -> usize {
        self.results.iter().filter(|r| !r.succeeded).count()
    }

    /// Process exit code for the report contract: 0 iff the run succeeded.
    pub fn exit_code(&self) -> i32 {
        if self.overall_success {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(label: &str, succeeded: bool) -> RunResult {
        RunResult {
            job_label: label.to_string(),
            exit_code: Some(if succeeded { 0 } else { 1 }),
            duration: Duration::from_millis(10),
            succeeded,
            timed_out: false,
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn counts_and_exit_code() {
        let report = RunReport {
            services: vec![],
            results: vec![result("sqlite", true), result("mysql", false)],
            teardown_errors: vec![],
            failure: None,
            overall_success: false,
        };
        assert_eq!(report.jobs_passed(), 1);
        assert_eq!(report.jobs_failed(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn json_uses_camel_case() {
        let report = RunReport {
            services: vec![ServiceReport::unstarted("db-a")],
            results: vec![result("sqlite", true)],
            teardown_errors: vec![],
            failure: Some(RunFailure::ServiceNotReady {
                service: "db-a".into(),
                last_error: "connection refused".into(),
            }),
            overall_success: false,
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"overallSuccess\""));
        assert!(json.contains("\"jobLabel\""));
        assert!(json.contains("\"probeAttempts\""));
        assert!(json.contains("\"serviceNotReady\""));
        assert!(!json.contains("\"job_label\""));
    }

    #[test]
    fn failure_display_names_service() {
        let failure = RunFailure::ServiceNotReady {
            service: "db-a".into(),
            last_error: "tcp 127.0.0.1:5432: connection refused".into(),
        };
        let text = failure.to_string();
        assert!(text.contains("db-a"));
        assert!(text.contains("connection refused"));
    }
}
