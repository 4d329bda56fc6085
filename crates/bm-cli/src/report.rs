use std::fmt::Write;
use std::time::Duration;

use bm_core::models::{RunReport, RunResult, ServiceReport, ServiceStatus};

/// Render the human-readable run summary: per-service readiness with wait
/// duration, per-job pass/fail, captured output for failures, and every
/// teardown error — regardless of the run's outcome.
pub fn render(report: &RunReport) -> String {
    let mut out = String::new();

    if !report.services.is_empty() {
        out.push_str("Services:\n");
        for service in &report.services {
            let _ = writeln!(out, "  {}", service_line(service));
        }
    }

    if !report.results.is_empty() {
        out.push_str("Jobs:\n");
        for result in &report.results {
            let _ = writeln!(out, "  {}", job_line(result));
        }
        for result in report.results.iter().filter(|r| !r.succeeded) {
            append_failure_output(&mut out, result);
        }
    }

    if let Some(failure) = &report.failure {
        let _ = writeln!(out, "Run failed: {failure}");
    }

    if !report.teardown_errors.is_empty() {
        out.push_str("Teardown errors:\n");
        for error in &report.teardown_errors {
            let _ = writeln!(out, "  {}: {}", error.service, error.reason);
        }
    }

    let _ = writeln!(
        out,
        "Result: {} ({} passed, {} failed)",
        if report.overall_success { "PASS" } else { "FAIL" },
        report.jobs_passed(),
        report.jobs_failed(),
    );
    out
}

fn service_line(service: &ServiceReport) -> String {
    match (service.ready_after, &service.error) {
        (Some(elapsed), _) => format!(
            "{:<20} ready in {} ({} probe{})",
            service.name,
            fmt_duration(elapsed),
            service.probe_attempts,
            if service.probe_attempts == 1 { "" } else { "s" },
        ),
        (None, Some(error)) => format!("{:<20} {error}", service.name),
        (None, None) => format!("{:<20} {}", service.name, status_text(service.status)),
    }
}

fn job_line(result: &RunResult) -> String {
    let verdict = if result.succeeded { "PASS" } else { "FAIL" };
    let detail = if result.timed_out {
        "timed out".to_string()
    } else {
        match result.exit_code {
            Some(code) => format!("exit {code}"),
            None => "killed".to_string(),
        }
    };
    format!(
        "{verdict}  {:<12} {detail}, {}",
        result.job_label,
        fmt_duration(result.duration),
    )
}

fn append_failure_output(out: &mut String, result: &RunResult) {
    let _ = writeln!(out, "--- output of failed job '{}' ---", result.job_label);
    let text = if !result.stderr.trim().is_empty() {
        tail(&result.stderr, 15)
    } else if !result.stdout.trim().is_empty() {
        tail(&result.stdout, 15)
    } else {
        "(no output)".to_string()
    };
    for line in text.lines() {
        let _ = writeln!(out, "  {line}");
    }
}

fn status_text(status: ServiceStatus) -> &'static str {
    match status {
        ServiceStatus::Unstarted => "not started",
        ServiceStatus::Starting => "starting",
        ServiceStatus::Ready => "ready",
        ServiceStatus::FailedToStart => "failed to start",
        ServiceStatus::Stopped => "stopped",
    }
}

fn fmt_duration(duration: Duration) -> String {
    if duration >= Duration::from_secs(1) {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Last N lines of a captured stream.
fn tail(text: &str, line_count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(line_count);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use bm_core::models::{RunFailure, TeardownError};
    use chrono::Utc;

    use super::*;

    fn ready_service(name: &str, attempts: u32) -> ServiceReport {
        let mut service = ServiceReport::unstarted(name);
        service.status = ServiceStatus::Stopped;
        service.ready_after = Some(Duration::from_millis(1400));
        service.probe_attempts = attempts;
        service
    }

    fn result(label: &str, succeeded: bool, stderr: &str) -> RunResult {
        RunResult {
            job_label: label.to_string(),
            exit_code: Some(if succeeded { 0 } else { 101 }),
            duration: Duration::from_millis(250),
            succeeded,
            timed_out: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn renders_services_jobs_and_summary() {
        let report = RunReport {
            services: vec![ready_service("casbin-postgres", 3)],
            results: vec![
                result("sqlite", true, ""),
                result("mysql", false, "test adapter::save_policy ... FAILED"),
            ],
            teardown_errors: vec![],
            failure: None,
            overall_success: false,
        };
        let text = render(&report);
        assert!(text.contains("casbin-postgres"));
        assert!(text.contains("ready in 1.4s (3 probes)"));
        assert!(text.contains("PASS  sqlite"));
        assert!(text.contains("FAIL  mysql"));
        assert!(text.contains("save_policy ... FAILED"));
        assert!(text.contains("Result: FAIL (1 passed, 1 failed)"));
    }

    #[test]
    fn renders_failure_and_teardown_errors() {
        let mut failed = ServiceReport::unstarted("casbin-mysql");
        failed.status = ServiceStatus::FailedToStart;
        failed.error = Some("service 'casbin-mysql' never became ready: tcp refused".into());

        let report = RunReport {
            services: vec![failed],
            results: vec![],
            teardown_errors: vec![TeardownError {
                service: "casbin-mysql".into(),
                reason: "stop command exited with code 1: no such container".into(),
            }],
            failure: Some(RunFailure::ServiceNotReady {
                service: "casbin-mysql".into(),
                last_error: "tcp refused".into(),
            }),
            overall_success: false,
        };
        let text = render(&report);
        assert!(text.contains("Run failed: service 'casbin-mysql' never became ready"));
        assert!(text.contains("Teardown errors:"));
        assert!(text.contains("no such container"));
        assert!(text.contains("Result: FAIL"));
    }

    #[test]
    fn timed_out_job_line() {
        let mut timed_out = result("postgres", false, "");
        timed_out.timed_out = true;
        timed_out.exit_code = None;
        let line = job_line(&timed_out);
        assert!(line.contains("FAIL"));
        assert!(line.contains("timed out"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=20).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let tailed = tail(&text, 15);
        assert!(tailed.starts_with("line 6"));
        assert!(tailed.ends_with("line 20"));
    }
}
