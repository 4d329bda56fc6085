use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::job::JobSpec;
use super::service::ServiceSpec;

/// Knobs for one orchestration run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Per-service deadline for the readiness wait.
    pub readiness_timeout: Duration,
    /// Initial probe interval; doubles after each failed attempt.
    pub poll_interval: Duration,
    /// Upper bound for the backoff interval.
    pub backoff_cap: Duration,
    /// Run-level default job timeout; a `JobSpec` timeout overrides it.
    pub job_timeout: Option<Duration>,
    /// Run jobs concurrently. Results are still reported in declaration
    /// order. `fail_fast` applies to serialized execution only.
    pub parallel_jobs: bool,
    /// Abort remaining jobs after the first job failure. Teardown still
    /// runs for every started service.
    pub fail_fast: bool,
    /// Count teardown errors against the overall success flag.
    pub fail_on_teardown: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(2),
            job_timeout: None,
            parallel_jobs: false,
            fail_fast: false,
            fail_on_teardown: false,
        }
    }
}

/// Serde shape of the `backend-matrix.yaml` matrix file.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    pub jobs: Vec<JobEntry>,
    #[serde(default)]
    pub options: OptionsEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub readiness: ProbeEntry,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub stop_before_start: bool,
}

/// Exactly one probe form must be given: `tcp: "host:port"`, a bare
/// `command`, or `command` plus `pattern`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeEntry {
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub label: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub expected_exit_code: i32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsEntry {
    #[serde(default)]
    pub readiness_timeout_secs: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub backoff_cap_ms: Option<u64>,
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
    #[serde(default)]
    pub parallel_jobs: Option<bool>,
    #[serde(default)]
    pub fail_fast: Option<bool>,
    #[serde(default)]
    pub fail_on_teardown: Option<bool>,
}

impl OptionsEntry {
    /// Merge the file's overrides onto the defaults.
    pub fn into_options(self) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            readiness_timeout: self
                .readiness_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.readiness_timeout),
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            backoff_cap: self
                .backoff_cap_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
            parallel_jobs: self.parallel_jobs.unwrap_or(defaults.parallel_jobs),
            fail_fast: self.fail_fast.unwrap_or(defaults.fail_fast),
            fail_on_teardown: self.fail_on_teardown.unwrap_or(defaults.fail_on_teardown),
        }
    }
}

/// Validated, ready-to-run form of a matrix file.
#[derive(Debug, Clone)]
pub struct MatrixPlan {
    pub services: Vec<ServiceSpec>,
    pub jobs: Vec<JobSpec>,
    pub options: RunOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let options = RunOptions::default();
        assert_eq!(options.readiness_timeout, Duration::from_secs(30));
        assert_eq!(options.poll_interval, Duration::from_millis(200));
        assert_eq!(options.backoff_cap, Duration::from_secs(2));
        assert_eq!(options.job_timeout, None);
        assert!(!options.parallel_jobs);
        assert!(!options.fail_fast);
        assert!(!options.fail_on_teardown);
    }

    #[test]
    fn options_entry_merges_onto_defaults() {
        let entry = OptionsEntry {
            readiness_timeout_secs: Some(5),
            fail_fast: Some(true),
            ..Default::default()
        };
        let options = entry.into_options();
        assert_eq!(options.readiness_timeout, Duration::from_secs(5));
        assert!(options.fail_fast);
        assert_eq!(options.poll_interval, Duration::from_millis(200));
    }
}
