use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::models::{
    ExecOutput, JobSpec, ReadinessProbe, RunFailure, RunOptions, RunReport, RunResult,
    ServiceReport, ServiceSpec, ServiceStatus, TeardownError,
};

use super::executor::CommandExecutor;
use super::probe::{self, WaitError};

/// Owns the lifecycle of the declared services and jobs: parallel start,
/// readiness join barrier, serialized job execution, unconditional
/// teardown in reverse start order.
pub struct Orchestrator {
    executor: Arc<dyn CommandExecutor>,
    options: RunOptions,
}

/// Startup progress reported by the per-service tasks. All run state is
/// mutated on the coordinating task only; tasks just send these.
enum ServiceEvent {
    Started { index: usize, handle: Option<String> },
    Ready { index: usize, attempts: u32, elapsed: Duration },
    Failed { index: usize, attempts: u32, failure: RunFailure },
    Aborted { index: usize },
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn CommandExecutor>, options: RunOptions) -> Self {
        Self { executor, options }
    }

    pub fn with_defaults(executor: Arc<dyn CommandExecutor>) -> Self {
        Self::new(executor, RunOptions::default())
    }

    /// Run without an external cancellation signal.
    pub async fn run(&self, services: &[ServiceSpec], jobs: &[JobSpec]) -> Result<RunReport> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_with_shutdown(services, jobs, shutdown_rx).await
    }

    /// Run the full lifecycle. Raising `shutdown` at any point after the
    /// first service start still drives the teardown path before this
    /// returns.
    ///
    /// Returns `Err` only for validation problems; every run that gets as
    /// far as starting services produces a `RunReport`.
    pub async fn run_with_shutdown(
        &self,
        services: &[ServiceSpec],
        jobs: &[JobSpec],
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        validate_services(services)?;

        let mut reports: Vec<ServiceReport> = services
            .iter()
            .map(|s| ServiceReport::unstarted(&s.name))
            .collect();

        // Single cancel flag for startup tasks and jobs, raised by the
        // external shutdown signal or by the first startup failure.
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort_tx = Arc::new(abort_tx);
        let (forwarder_done_tx, forwarder_done_rx) = oneshot::channel::<()>();
        {
            let abort_tx = Arc::clone(&abort_tx);
            let mut external = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = probe::wait_cancelled(&mut external) => {
                        let _ = abort_tx.send(true);
                    }
                    _ = forwarder_done_rx => {}
                }
            });
        }

        info!(services = services.len(), jobs = jobs.len(), "starting run");

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        for (index, spec) in services.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let spec = spec.clone();
            let options = self.options.clone();
            let tx = event_tx.clone();
            let abort = abort_rx.clone();
            tokio::spawn(start_service(index, executor, spec, options, tx, abort));
        }
        drop(event_tx);

        // Join barrier: every service must resolve (ready, failed, or
        // aborted) before anything else happens.
        let mut start_order: Vec<usize> = Vec::new();
        let mut ready = 0usize;
        let mut failure: Option<RunFailure> = None;
        while let Some(event) = event_rx.recv().await {
            match event {
                ServiceEvent::Started { index, handle } => {
                    debug!(service = %services[index].name, "service started");
                    reports[index].status = ServiceStatus::Starting;
                    reports[index].handle = handle;
                    start_order.push(index);
                }
                ServiceEvent::Ready {
                    index,
                    attempts,
                    elapsed,
                } => {
                    info!(service = %services[index].name, attempts, ?elapsed, "service ready");
                    reports[index].status = ServiceStatus::Ready;
                    reports[index].probe_attempts = attempts;
                    reports[index].ready_after = Some(elapsed);
                    ready += 1;
                }
                ServiceEvent::Failed {
                    index,
                    attempts,
                    failure: f,
                } => {
                    warn!(service = %services[index].name, error = %f, "service failed");
                    reports[index].status = ServiceStatus::FailedToStart;
                    reports[index].probe_attempts = attempts;
                    reports[index].error = Some(f.to_string());
                    if failure.is_none() {
                        failure = Some(f);
                        let _ = abort_tx.send(true);
                    }
                }
                ServiceEvent::Aborted { index } => {
                    debug!(service = %services[index].name, "startup aborted");
                }
            }
        }

        if failure.is_none() && ready != services.len() {
            failure = Some(if *shutdown.borrow() {
                RunFailure::Interrupted
            } else {
                // A startup task ended without reporting; treat the first
                // non-ready service as never ready rather than guessing.
                match reports.iter().find(|r| r.status != ServiceStatus::Ready) {
                    Some(stuck) => RunFailure::ServiceNotReady {
                        service: stuck.name.clone(),
                        last_error: "startup ended unexpectedly".into(),
                    },
                    None => RunFailure::Interrupted,
                }
            });
        }

        let mut results: Vec<RunResult> = Vec::new();
        if failure.is_none() {
            let interrupted = if self.options.parallel_jobs {
                self.run_jobs_parallel(jobs, &abort_rx, &mut results).await
            } else {
                self.run_jobs_serialized(jobs, &abort_rx, &mut results).await
            };
            if interrupted {
                failure = Some(RunFailure::Interrupted);
            }
        }

        let teardown_errors = self.teardown(services, &start_order, &mut reports).await;
        drop(forwarder_done_tx);

        let jobs_ok = results.len() == jobs.len() && results.iter().all(|r| r.succeeded);
        let teardown_ok = teardown_errors.is_empty() || !self.options.fail_on_teardown;
        let overall_success = failure.is_none() && jobs_ok && teardown_ok;

        Ok(RunReport {
            services: reports,
            results,
            teardown_errors,
            failure,
            overall_success,
        })
    }

    async fn run_jobs_serialized(
        &self,
        jobs: &[JobSpec],
        abort: &watch::Receiver<bool>,
        results: &mut Vec<RunResult>,
    ) -> bool {
        for job in jobs {
            if *abort.borrow() {
                return true;
            }
            info!(job = %job.label, "running job");
            let mut abort = abort.clone();
            let (result, interrupted) =
                run_job(self.executor.as_ref(), job, self.options.job_timeout, &mut abort).await;
            let failed = !result.succeeded;
            results.push(result);
            if interrupted {
                return true;
            }
            if failed && self.options.fail_fast {
                info!(job = %job.label, "fail-fast: skipping remaining jobs");
                break;
            }
        }
        false
    }

    async fn run_jobs_parallel(
        &self,
        jobs: &[JobSpec],
        abort: &watch::Receiver<bool>,
        results: &mut Vec<RunResult>,
    ) -> bool {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (index, job) in jobs.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let job = job.clone();
            let timeout = self.options.job_timeout;
            let tx = tx.clone();
            let mut abort = abort.clone();
            tokio::spawn(async move {
                let outcome = run_job(executor.as_ref(), &job, timeout, &mut abort).await;
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<(RunResult, bool)>> = (0..jobs.len()).map(|_| None).collect();
        while let Some((index, outcome)) = rx.recv().await {
            slots[index] = Some(outcome);
        }

        // Report in declaration order regardless of completion order.
        let mut interrupted = false;
        for slot in slots.into_iter().flatten() {
            interrupted |= slot.1;
            results.push(slot.0);
        }
        interrupted
    }

    /// Stop every service that reached at least `Starting`, in reverse
    /// start order. Each attempt is independent; errors are collected
    /// and never block the remaining stops. Not cancellable.
    async fn teardown(
        &self,
        services: &[ServiceSpec],
        start_order: &[usize],
        reports: &mut [ServiceReport],
    ) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        for &index in start_order.iter().rev() {
            let spec = &services[index];
            info!(service = %spec.name, "stopping service");
            match self.executor.run(&spec.stop).await {
                Ok(out) if out.success() => {
                    reports[index].status = ServiceStatus::Stopped;
                }
                Ok(out) => {
                    let reason = match out.exit_code {
                        Some(code) => format!(
                            "stop command exited with code {code}: {}",
                            out.stderr.lines().next().unwrap_or("no output")
                        ),
                        None => "stop command killed by signal".into(),
                    };
                    warn!(service = %spec.name, %reason, "teardown failed");
                    errors.push(TeardownError {
                        service: spec.name.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    warn!(service = %spec.name, error = %e, "teardown failed");
                    errors.push(TeardownError {
                        service: spec.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        errors
    }
}

/// Start one service and wait for readiness, reporting progress through
/// the event channel. `Started` is sent as soon as the start command
/// succeeds so teardown covers the service no matter what happens next.
async fn start_service(
    index: usize,
    executor: Arc<dyn CommandExecutor>,
    spec: ServiceSpec,
    options: RunOptions,
    tx: mpsc::UnboundedSender<ServiceEvent>,
    mut abort: watch::Receiver<bool>,
) {
    if *abort.borrow() {
        let _ = tx.send(ServiceEvent::Aborted { index });
        return;
    }

    if spec.stop_before_start {
        // Clearing a stale instance under the same name; failure here
        // just means there was nothing to clear.
        if let Err(e) = executor.run(&spec.stop).await {
            debug!(service = %spec.name, error = %e, "pre-start stop failed");
        }
    }

    match executor.run(&spec.start).await {
        Ok(out) if out.success() => {
            let handle = out
                .stdout
                .lines()
                .next()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty());
            let _ = tx.send(ServiceEvent::Started { index, handle });
        }
        Ok(out) => {
            let reason = match out.exit_code {
                Some(code) => format!(
                    "start command exited with code {code}: {}",
                    out.stderr.lines().next().unwrap_or("no output")
                ),
                None => "start command killed by signal".into(),
            };
            let _ = tx.send(ServiceEvent::Failed {
                index,
                attempts: 0,
                failure: RunFailure::ServiceStartFailed {
                    service: spec.name.clone(),
                    reason,
                },
            });
            return;
        }
        Err(e) => {
            let _ = tx.send(ServiceEvent::Failed {
                index,
                attempts: 0,
                failure: RunFailure::ServiceStartFailed {
                    service: spec.name.clone(),
                    reason: e.to_string(),
                },
            });
            return;
        }
    }

    match probe::wait_ready(
        executor.as_ref(),
        &spec.name,
        &spec.readiness,
        &options,
        &mut abort,
    )
    .await
    {
        Ok(outcome) => {
            let _ = tx.send(ServiceEvent::Ready {
                index,
                attempts: outcome.attempts,
                elapsed: outcome.elapsed,
            });
        }
        Err(WaitError::NeverReady {
            attempts,
            last_error,
        }) => {
            let _ = tx.send(ServiceEvent::Failed {
                index,
                attempts,
                failure: RunFailure::ServiceNotReady {
                    service: spec.name.clone(),
                    last_error,
                },
            });
        }
        Err(WaitError::Cancelled) => {
            let _ = tx.send(ServiceEvent::Aborted { index });
        }
    }
}

async fn run_job(
    executor: &dyn CommandExecutor,
    job: &JobSpec,
    default_timeout: Option<Duration>,
    abort: &mut watch::Receiver<bool>,
) -> (RunResult, bool) {
    let started_at = Utc::now();
    let begun = Instant::now();
    let limit = job.timeout.or(default_timeout);

    enum Outcome {
        Done(Result<ExecOutput>),
        TimedOut,
        Interrupted,
    }

    let run = executor.run(&job.command);
    tokio::pin!(run);
    let outcome = if let Some(limit) = limit {
        tokio::select! {
            res = tokio::time::timeout(limit, &mut run) => match res {
                Ok(r) => Outcome::Done(r),
                Err(_) => Outcome::TimedOut,
            },
            _ = probe::wait_cancelled(abort) => Outcome::Interrupted,
        }
    } else {
        tokio::select! {
            res = &mut run => Outcome::Done(res),
            _ = probe::wait_cancelled(abort) => Outcome::Interrupted,
        }
    };

    let base = RunResult {
        job_label: job.label.clone(),
        exit_code: None,
        duration: begun.elapsed(),
        succeeded: false,
        timed_out: false,
        stdout: String::new(),
        stderr: String::new(),
        started_at,
    };
    match outcome {
        Outcome::Done(Ok(out)) => {
            let succeeded = out.exit_code == Some(job.expected_exit_code);
            (
                RunResult {
                    exit_code: out.exit_code,
                    succeeded,
                    stdout: out.stdout,
                    stderr: out.stderr,
                    ..base
                },
                false,
            )
        }
        Outcome::Done(Err(e)) => (
            RunResult {
                stderr: e.to_string(),
                ..base
            },
            false,
        ),
        Outcome::TimedOut => (
            RunResult {
                timed_out: true,
                ..base
            },
            false,
        ),
        Outcome::Interrupted => (
            RunResult {
                stderr: "interrupted before completion".into(),
                ..base
            },
            true,
        ),
    }
}

fn validate_services(services: &[ServiceSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in services {
        if !seen.insert(spec.name.as_str()) {
            return Err(OrchestratorError::DuplicateService(spec.name.clone()));
        }
        if let ReadinessProbe::LogPattern { pattern, .. } = &spec.readiness {
            regex::Regex::new(pattern).map_err(|e| OrchestratorError::InvalidProbe {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandSpec;

    fn service(name: &str) -> ServiceSpec {
        ServiceSpec::new(
            name,
            CommandSpec::new("docker").args(["run", "-d", name]),
            CommandSpec::new("docker").args(["rm", "-f", name]),
            ReadinessProbe::Command {
                command: CommandSpec::new("true"),
            },
        )
    }

    #[test]
    fn duplicate_names_rejected() {
        let services = vec![service("db-a"), service("db-a")];
        let err = validate_services(&services).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateService(name) if name == "db-a"));
    }

    #[test]
    fn invalid_log_pattern_rejected() {
        let mut spec = service("db-a");
        spec.readiness = ReadinessProbe::LogPattern {
            command: CommandSpec::new("docker").args(["logs", "db-a"]),
            pattern: "(unclosed".into(),
        };
        let err = validate_services(&[spec]).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidProbe { .. }));
    }
}
