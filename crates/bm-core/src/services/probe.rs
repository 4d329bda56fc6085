use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

use crate::models::{ExecOutput, ReadinessProbe, RunOptions};

use super::executor::CommandExecutor;

/// Successful readiness wait: how many probe attempts it took and how
/// long the service needed to come up.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// A readiness wait that did not succeed.
#[derive(Debug)]
pub enum WaitError {
    /// The probe never passed before the deadline. Carries the last
    /// probe failure so the report can name it.
    NeverReady { attempts: u32, last_error: String },
    Cancelled,
}

/// Resolve once the shutdown flag is raised. If the sender is gone the
/// flag can never be raised again, so park forever instead of spinning.
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Poll a readiness probe with exponential backoff until it passes, the
/// deadline elapses, or the run is cancelled.
///
/// Transient probe errors (connection refused, non-zero exit, spawn
/// failure while the service initializes) count as "not ready yet";
/// only the deadline fails the wait.
pub async fn wait_ready(
    executor: &dyn CommandExecutor,
    service: &str,
    probe: &ReadinessProbe,
    options: &RunOptions,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ProbeOutcome, WaitError> {
    let pattern = match probe {
        ReadinessProbe::LogPattern { pattern, .. } => match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                return Err(WaitError::NeverReady {
                    attempts: 0,
                    last_error: format!("invalid readiness pattern: {e}"),
                })
            }
        },
        _ => None,
    };

    let start = Instant::now();
    let deadline = start + options.readiness_timeout;
    let mut delay = options.poll_interval;
    let mut attempts = 0u32;
    let mut last_error = String::from("probe never attempted");

    loop {
        attempts += 1;
        match attempt_once(executor, probe, pattern.as_ref(), options.backoff_cap).await {
            Ok(()) => {
                return Ok(ProbeOutcome {
                    attempts,
                    elapsed: start.elapsed(),
                })
            }
            Err(reason) => {
                tracing::debug!(service, attempt = attempts, %reason, "probe not ready");
                last_error = reason;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::NeverReady {
                attempts,
                last_error,
            });
        }
        let wait = delay.min(deadline - now);
        tokio::select! {
            _ = sleep(wait) => {}
            _ = wait_cancelled(shutdown) => return Err(WaitError::Cancelled),
        }
        delay = (delay * 2).min(options.backoff_cap);
    }
}

async fn attempt_once(
    executor: &dyn CommandExecutor,
    probe: &ReadinessProbe,
    pattern: Option<&Regex>,
    connect_timeout: Duration,
) -> Result<(), String> {
    match probe {
        ReadinessProbe::Command { command } => match executor.run(command).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(probe_failure_text(&out)),
            Err(e) => Err(e.to_string()),
        },
        ReadinessProbe::Tcp { host, port } => {
            match timeout(connect_timeout, TcpStream::connect((host.as_str(), *port))).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(format!("tcp {host}:{port}: {e}")),
                Err(_) => Err(format!("tcp {host}:{port}: connect timed out")),
            }
        }
        ReadinessProbe::LogPattern { command, .. } => {
            let Some(regex) = pattern else {
                return Err("readiness pattern was not compiled".into());
            };
            match executor.run(command).await {
                Ok(out) => {
                    if regex.is_match(&out.stdout) || regex.is_match(&out.stderr) {
                        Ok(())
                    } else {
                        Err(format!("pattern '{regex}' not yet present in output"))
                    }
                }
                Err(e) => Err(e.to_string()),
            }
        }
    }
}

fn probe_failure_text(out: &ExecOutput) -> String {
    let detail = out
        .stderr
        .lines()
        .next()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or("no output");
    match out.exit_code {
        Some(code) => format!("probe exited with code {code}: {detail}"),
        None => format!("probe killed by signal: {detail}"),
    }
}
