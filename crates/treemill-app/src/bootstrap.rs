use std::io;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use treemill_batch::{BatchRunner, CancellationController, RunSummary};
use treemill_config::{FailurePolicy, RunConfig};
use treemill_telemetry::{LoggingConfig, Metrics, build_sha, init_logging};

use crate::cli::Cli;
use crate::error::{AppError, AppResult, EXIT_JOB_FAILURES, EXIT_OK};

/// How a run that reached the end should be reported to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every job succeeded, the run was cancelled, or failures are report-only.
    Completed,
    /// At least one job failed or timed out and the strict policy is active.
    JobFailures,
}

impl RunOutcome {
    /// Decide the outcome of a finished run under `policy`.
    #[must_use]
    pub const fn from_summary(summary: &RunSummary, policy: FailurePolicy) -> Self {
        if summary.should_fail(policy) {
            Self::JobFailures
        } else {
            Self::Completed
        }
    }

    /// Process exit status for this outcome.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Completed => EXIT_OK,
            Self::JobFailures => EXIT_JOB_FAILURES,
        }
    }
}

/// Entry point for the binary: logging, signals, the batch run and metrics export.
///
/// # Errors
///
/// Returns an error if logging cannot be installed, the configuration is
/// invalid, the run stops on a fatal error, or metrics cannot be written.
pub async fn run_app(cli: Cli) -> AppResult<RunOutcome> {
    let logging = LoggingConfig {
        level: &cli.log_level,
        format: cli.log_format(),
        build_sha: option_env!("TREEMILL_BUILD_SHA").unwrap_or("dev"),
    };
    init_logging(&logging).map_err(|err| AppError::telemetry("telemetry.init", err))?;

    let config = cli
        .run_config()
        .map_err(|err| AppError::config("run_config.validate", err))?;
    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    info!(
        build_sha = build_sha(),
        source = %config.source_root.display(),
        dest = %config.dest_root.display(),
        jobs = config.capacity,
        "treemill starting"
    );

    let cancel = CancellationController::new();
    let signals = spawn_signal_listener(cancel.clone());
    let result = run_batch(config, metrics.clone(), &cancel).await;
    signals.abort();

    if let Some(path) = &cli.metrics_out {
        metrics
            .write_to(path)
            .map_err(|err| AppError::telemetry("telemetry.metrics_write", err))?;
        info!(path = %path.display(), "metrics written");
    }
    result
}

/// Run one batch against an explicit cancellation controller and classify the result.
///
/// # Errors
///
/// Returns [`AppError::Batch`] when the run stops on a fatal error.
pub async fn run_batch(
    config: RunConfig,
    metrics: Metrics,
    cancel: &CancellationController,
) -> AppResult<RunOutcome> {
    let policy = config.failure_policy;
    let runner = BatchRunner::new(config, metrics);
    let summary = runner
        .run(cancel)
        .await
        .map_err(|err| AppError::batch("batch.run", err))?;

    for failure in &summary.failures {
        warn!(
            source = %failure.source.display(),
            reason = failure.reason,
            "job did not produce output"
        );
    }
    if let Some(reason) = cancel.reason() {
        info!(reason, "run ended early after cancellation");
    }

    let outcome = RunOutcome::from_summary(&summary, policy);
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed + summary.timed_out,
        policy = policy.as_str(),
        exit_code = outcome.exit_code(),
        "run complete"
    );
    Ok(outcome)
}

fn spawn_signal_listener(cancel: CancellationController) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => {
                cancel.cancel(signal);
            }
            Err(err) => {
                warn!(error = %err, "failed to install signal handlers; interrupts will not cancel the run");
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(received)
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl_c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn summary_with(failed: u64, timed_out: u64) -> RunSummary {
        RunSummary {
            failed,
            timed_out,
            ..RunSummary::default()
        }
    }

    #[test]
    fn report_policy_never_changes_exit_status() {
        let outcome = RunOutcome::from_summary(&summary_with(3, 1), FailurePolicy::Report);
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn fail_run_policy_maps_failures_to_exit_four() {
        let failing = RunOutcome::from_summary(&summary_with(0, 1), FailurePolicy::FailRun);
        assert_eq!(failing.exit_code(), 4);
        let clean = RunOutcome::from_summary(&summary_with(0, 0), FailurePolicy::FailRun);
        assert_eq!(clean, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn signal_listener_can_be_aborted_without_cancelling() {
        let cancel = CancellationController::new();
        let listener = spawn_signal_listener(cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        listener.abort();
        let joined = listener.await;
        assert!(joined.is_err_and(|err| err.is_cancelled()));
        assert!(!cancel.is_cancelled());
    }
}
