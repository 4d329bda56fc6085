mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;

use bm_core::services::config_loader;
use bm_core::services::executor::ProcessExecutor;
use bm_core::services::orchestrator::Orchestrator;

const CONFIG_FILENAME: &str = "backend-matrix.yaml";

const USAGE: &str = "\
backend-matrix — run a backend test matrix against ephemeral services

Usage: backend-matrix [CONFIG] [options]

Arguments:
  CONFIG           Path to the matrix file (default: backend-matrix.yaml,
                   searched upward to the nearest repository root)

Options:
  --fail-fast      Stop after the first failing job
  --parallel-jobs  Run jobs concurrently
  --json           Print the run report as JSON
  --debug          Write debug logs to .backend-matrix-debug.log
  -h, --help       Show this help";

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config: Option<PathBuf>,
    fail_fast: bool,
    parallel_jobs: bool,
    json: bool,
    debug: bool,
    help: bool,
}

impl CliArgs {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut parsed = Self::default();
        for arg in args {
            match arg.as_str() {
                "--fail-fast" => parsed.fail_fast = true,
                "--parallel-jobs" => parsed.parallel_jobs = true,
                "--json" => parsed.json = true,
                "--debug" => parsed.debug = true,
                "-h" | "--help" => parsed.help = true,
                other if other.starts_with('-') => {
                    return Err(format!("unknown option '{other}'"));
                }
                path => {
                    if parsed.config.is_some() {
                        return Err("only one CONFIG argument is accepted".into());
                    }
                    parsed.config = Some(PathBuf::from(path));
                }
            }
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match CliArgs::parse(&args) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("{message}\n\n{USAGE}");
            return Ok(ExitCode::from(2));
        }
    };
    if cli.help {
        println!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    let _guard = if cli.debug {
        Some(setup_debug_logging())
    } else {
        None
    };

    let config_path = cli.config.clone().unwrap_or_else(find_config_file);
    tracing::debug!(path = %config_path.display(), "loading matrix config");
    let mut plan = config_loader::load(&config_path)?;
    if cli.fail_fast {
        plan.options.fail_fast = true;
    }
    if cli.parallel_jobs {
        plan.options.parallel_jobs = true;
    }

    // Ctrl-C becomes the orchestrator's shutdown signal; teardown still
    // runs before the report is printed.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; tearing down services");
            let _ = shutdown_tx.send(true);
        }
    });

    let orchestrator = Orchestrator::new(Arc::new(ProcessExecutor), plan.options.clone());
    let run_report = orchestrator
        .run_with_shutdown(&plan.services, &plan.jobs, shutdown_rx)
        .await?;

    if cli.json {
        println!("{}", run_report.to_json()?);
    } else {
        print!("{}", report::render(&run_report));
    }

    Ok(if run_report.overall_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Configure file-based tracing to `.backend-matrix-debug.log` in CWD,
/// keeping stdout reserved for the report. Returns the guard that must be
/// held alive for the duration of the program.
fn setup_debug_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", ".backend-matrix-debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_ansi(false)
        .init();

    guard
}

/// Find the matrix file, walking up from CWD to the nearest repository root.
fn find_config_file() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let mut dir = cwd.as_path();
    loop {
        let candidate = dir.join(CONFIG_FILENAME);
        if candidate.exists() {
            return candidate;
        }
        if dir.join(".git").exists() {
            return candidate;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    cwd.join(CONFIG_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_empty_args() {
        let cli = CliArgs::parse(&[]).unwrap();
        assert_eq!(cli, CliArgs::default());
    }

    #[test]
    fn parse_flags_and_config() {
        let cli = CliArgs::parse(&args(&["ci/matrix.yaml", "--fail-fast", "--json"])).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("ci/matrix.yaml")));
        assert!(cli.fail_fast);
        assert!(cli.json);
        assert!(!cli.debug);
    }

    #[test]
    fn unknown_option_rejected() {
        let err = CliArgs::parse(&args(&["--nope"])).unwrap_err();
        assert!(err.contains("--nope"));
    }

    #[test]
    fn second_config_rejected() {
        let err = CliArgs::parse(&args(&["a.yaml", "b.yaml"])).unwrap_err();
        assert!(err.contains("only one"));
    }
}
