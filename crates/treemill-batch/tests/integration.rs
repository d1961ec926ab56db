use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use treemill_batch::{
    BatchRunner, CancellationController, JobDescriptor, JobError, RunSummary, TransformStatus,
    Transformer,
};
use treemill_config::{CancelMode, FailurePolicy, RunConfig};
use treemill_telemetry::Metrics;
use treemill_test_support::fixtures::Workspace;

/// In-process transformer recording how many invocations overlap.
#[derive(Default)]
struct Tracker {
    delay: Duration,
    fail_every: Option<usize>,
    cancel_on_first: Option<CancellationController>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    started_after_stop: AtomicUsize,
}

#[async_trait]
impl Transformer for Tracker {
    async fn transform(
        &self,
        job: &JobDescriptor,
        stop: &CancellationToken,
    ) -> Result<TransformStatus, JobError> {
        if stop.is_cancelled() {
            self.started_after_stop.fetch_add(1, Ordering::SeqCst);
            return Ok(TransformStatus::Interrupted);
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if let Some(cancel) = &self.cancel_on_first {
            cancel.cancel("test");
        }

        let interrupted = tokio::select! {
            () = stop.cancelled() => true,
            () = tokio::time::sleep(self.delay) => false,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        if interrupted {
            return Ok(TransformStatus::Interrupted);
        }
        if self.fail_every.is_some_and(|every| call % every == 0) {
            return Err(JobError::ExitStatus {
                program: PathBuf::from("tracker"),
                code: Some(1),
                stderr: format!("induced failure for {}", job.relative().display()),
            });
        }
        std::fs::write(job.destination(), b"transformed").map_err(|source| JobError::Wait {
            program: PathBuf::from("tracker"),
            source,
        })?;
        Ok(TransformStatus::Completed)
    }
}

fn assert_gate_balanced(summary: &RunSummary, capacity: usize) -> anyhow::Result<()> {
    let gate = summary
        .gate
        .ok_or_else(|| anyhow::anyhow!("summary missing gate snapshot"))?;
    assert_eq!(gate.acquired_total, gate.released_total);
    assert_eq!(gate.outstanding, 0);
    assert!(gate.high_water <= capacity, "high water {} > {capacity}", gate.high_water);
    Ok(())
}

async fn run_with(
    config: RunConfig,
    transformer: Arc<dyn Transformer>,
    cancel: &CancellationController,
) -> anyhow::Result<RunSummary> {
    let runner = BatchRunner::new(config.validated()?, Metrics::new()?).with_transformer(transformer);
    Ok(tokio::time::timeout(Duration::from_secs(30), runner.run(cancel)).await??)
}

#[tokio::test]
async fn capacity_one_never_overlaps_jobs() -> anyhow::Result<()> {
    let workspace = Workspace::new()?;
    workspace.write_sources(&["1.pyc", "2.pyc", "3.pyc", "d/4.pyc", "d/5.pyc"])?;
    let tracker = Arc::new(Tracker {
        delay: Duration::from_millis(30),
        ..Tracker::default()
    });

    let config = RunConfig::new(workspace.source(), workspace.dest()).with_capacity(1);
    let summary = run_with(config, tracker.clone(), &CancellationController::new()).await?;

    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(workspace.dest_files()?.len(), 5);
    assert_gate_balanced(&summary, 1)
}

#[tokio::test]
async fn induced_failures_keep_concurrency_bounded() -> anyhow::Result<()> {
    let workspace = Workspace::new()?;
    let names: Vec<String> = (0..12).map(|index| format!("pkg{}/m{index}.pyc", index % 3)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    workspace.write_sources(&names)?;
    let tracker = Arc::new(Tracker {
        delay: Duration::from_millis(10),
        fail_every: Some(2),
        ..Tracker::default()
    });

    let config = RunConfig::new(workspace.source(), workspace.dest()).with_capacity(3);
    let summary = run_with(config, tracker.clone(), &CancellationController::new()).await?;

    assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(summary.discovered, 12);
    assert_eq!(summary.succeeded + summary.failed, 12);
    assert_eq!(summary.failed, 6);
    assert_eq!(summary.failures.len(), 6);
    assert_eq!(workspace.dest_files()?.len(), 6);
    assert!(!summary.should_fail(FailurePolicy::Report));
    assert!(summary.should_fail(FailurePolicy::FailRun));
    assert_gate_balanced(&summary, 3)
}

#[tokio::test]
async fn cancellation_mid_walk_starts_nothing_new() -> anyhow::Result<()> {
    let workspace = Workspace::new()?;
    let names: Vec<String> = (0..10).map(|index| format!("m{index}.pyc")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    workspace.write_sources(&names)?;

    let cancel = CancellationController::new();
    let tracker = Arc::new(Tracker {
        delay: Duration::from_secs(10),
        cancel_on_first: Some(cancel.clone()),
        ..Tracker::default()
    });

    let config = RunConfig::new(workspace.source(), workspace.dest()).with_capacity(1);
    let summary = run_with(config, tracker.clone(), &cancel).await?;

    assert!(summary.cancelled);
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.started_after_stop.load(Ordering::SeqCst), 0);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.cancelled_jobs, 1);
    assert!(summary.not_started >= 1);
    assert!(workspace.dest_files()?.is_empty());
    assert_gate_balanced(&summary, 1)
}

#[tokio::test]
async fn drain_mode_lets_admitted_jobs_finish() -> anyhow::Result<()> {
    let workspace = Workspace::new()?;
    workspace.write_sources(&["a.pyc", "b.pyc", "c.pyc", "d.pyc"])?;
    let cancel = CancellationController::new();
    let tracker = Arc::new(Tracker {
        delay: Duration::from_millis(200),
        cancel_on_first: Some(cancel.clone()),
        ..Tracker::default()
    });

    let config = RunConfig::new(workspace.source(), workspace.dest())
        .with_capacity(1)
        .with_cancel_mode(CancelMode::Drain);
    let summary = run_with(config, tracker.clone(), &cancel).await?;

    assert!(summary.cancelled);
    assert_eq!(summary.cancelled_jobs, 0);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(workspace.dest_files()?.len(), 1);
    assert_gate_balanced(&summary, 1)
}

#[tokio::test]
async fn pre_cancelled_run_dispatches_nothing() -> anyhow::Result<()> {
    let workspace = Workspace::new()?;
    workspace.write_sources(&["a.pyc"])?;
    let cancel = CancellationController::new();
    cancel.cancel("test");
    let tracker = Arc::new(Tracker::default());

    let summary = run_with(
        RunConfig::new(workspace.source(), workspace.dest()),
        tracker.clone(),
        &cancel,
    )
    .await?;

    assert!(summary.cancelled);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(tracker.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[cfg(unix)]
mod process {
    use super::*;
    use treemill_test_support::fixtures::{
        COPY_SCRIPT, SHELL, failing_script, permissions_enforced, sleeping_script,
    };

    fn shell_config(workspace: &Workspace, script: &std::path::Path) -> RunConfig {
        let mut config =
            RunConfig::new(workspace.source(), workspace.dest()).with_transformer(SHELL);
        config.transformer_args = vec![script.display().to_string()];
        config
    }

    async fn run_process(config: RunConfig, cancel: &CancellationController) -> anyhow::Result<RunSummary> {
        let runner = BatchRunner::new(config.validated()?, Metrics::new()?);
        Ok(tokio::time::timeout(Duration::from_secs(30), runner.run(cancel)).await??)
    }

    #[tokio::test]
    async fn mirrors_eligible_files_into_destination() -> anyhow::Result<()> {
        let workspace = Workspace::new()?;
        workspace.write_sources(&["a.pyc", "sub/b.pyc", "sub/c.txt"])?;
        let script = workspace.script("copy.sh", COPY_SCRIPT)?;

        let config = shell_config(&workspace, &script).with_capacity(2);
        let summary = run_process(config, &CancellationController::new()).await?;

        assert_eq!(
            workspace.dest_files()?,
            vec![PathBuf::from("a.py"), PathBuf::from("sub/b.py")]
        );
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.succeeded, 2);
        assert!(summary.failures.is_empty());
        assert!(!summary.cancelled);
        assert_gate_balanced(&summary, 2)
    }

    #[tokio::test]
    async fn failing_job_is_isolated_and_reported() -> anyhow::Result<()> {
        let workspace = Workspace::new()?;
        workspace.write_sources(&["a.pyc", "sub/b.pyc", "sub/c.txt"])?;
        let script = workspace.script("fail.sh", &failing_script("b.pyc"))?;

        let config = shell_config(&workspace, &script).with_capacity(2);
        let summary = run_process(config, &CancellationController::new()).await?;

        assert_eq!(workspace.dest_files()?, vec![PathBuf::from("a.py")]);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        let failure = summary
            .failures
            .first()
            .ok_or_else(|| anyhow::anyhow!("expected one failure"))?;
        assert_eq!(failure.relative, PathBuf::from("sub/b.pyc"));
        assert_eq!(failure.reason, "exit_status");
        assert!(failure.detail.contains("cannot decompile"));
        assert_gate_balanced(&summary, 2)
    }

    #[tokio::test]
    async fn missing_transformer_fails_every_job_without_aborting() -> anyhow::Result<()> {
        let workspace = Workspace::new()?;
        workspace.write_sources(&["a.pyc", "b.pyc"])?;
        let config = RunConfig::new(workspace.source(), workspace.dest())
            .with_transformer(workspace.source().join("no-such-transformer"));

        let summary = run_process(config, &CancellationController::new()).await?;

        assert_eq!(summary.failed, 2);
        assert!(summary.failures.iter().all(|failure| failure.reason == "spawn"));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_kills_running_transformers() -> anyhow::Result<()> {
        let workspace = Workspace::new()?;
        workspace.write_sources(&["a.pyc", "b.pyc", "c.pyc"])?;
        let script = workspace.script("hang.sh", "exec sleep 30\n")?;
        let config = shell_config(&workspace, &script).with_capacity(2);

        let cancel = CancellationController::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel("SIGTERM");
        });

        let started = std::time::Instant::now();
        let summary = run_process(config, &cancel).await?;

        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(summary.cancelled);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.cancelled_jobs, summary.dispatched);
        assert!(workspace.dest_files()?.is_empty());
        assert_gate_balanced(&summary, 2)
    }

    #[tokio::test]
    async fn job_timeout_kills_slow_transformer() -> anyhow::Result<()> {
        let workspace = Workspace::new()?;
        workspace.write_sources(&["slow.pyc"])?;
        let script = workspace.script("hang.sh", "exec sleep 30\n")?;
        let config = shell_config(&workspace, &script)
            .with_job_timeout(Some(Duration::from_millis(200)))
            .with_failure_policy(FailurePolicy::FailRun);

        let summary = run_process(config, &CancellationController::new()).await?;

        assert_eq!(summary.timed_out, 1);
        assert!(!summary.cancelled);
        assert_eq!(
            summary.failures.first().map(|failure| failure.reason),
            Some("timed_out")
        );
        assert!(summary.should_fail(FailurePolicy::FailRun));
        Ok(())
    }

    #[tokio::test]
    async fn slow_jobs_under_capacity_one_all_complete() -> anyhow::Result<()> {
        let workspace = Workspace::new()?;
        workspace.write_sources(&["1.pyc", "2.pyc", "3.pyc", "4.pyc", "5.pyc"])?;
        let script = workspace.script("slow.sh", &sleeping_script("0.05"))?;

        let summary = run_process(
            shell_config(&workspace, &script).with_capacity(1),
            &CancellationController::new(),
        )
        .await?;

        assert_eq!(summary.succeeded, 5);
        assert_eq!(workspace.dest_files()?.len(), 5);
        assert_gate_balanced(&summary, 1)
    }

    #[tokio::test]
    async fn background_descendants_do_not_hold_the_job_open() -> anyhow::Result<()> {
        let workspace = Workspace::new()?;
        workspace.write_sources(&["a.pyc", "b.pyc"])?;
        let script = workspace.script(
            "detach.sh",
            "case \"$3\" in\n  *b.pyc) echo \"broken $3\" >&2; sleep 3 & exit 1 ;;\nesac\ncp \"$3\" \"$2\"\nsleep 3 &\nexit 0\n",
        )?;

        let started = std::time::Instant::now();
        let summary = run_process(
            shell_config(&workspace, &script).with_capacity(1),
            &CancellationController::new(),
        )
        .await?;

        assert!(
            started.elapsed() < Duration::from_secs(2),
            "run took {:?}",
            started.elapsed()
        );
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(workspace.dest_files()?, vec![PathBuf::from("a.py")]);
        let failure = summary
            .failures
            .first()
            .ok_or_else(|| anyhow::anyhow!("expected one failure"))?;
        assert!(failure.detail.contains("broken"), "detail: {}", failure.detail);
        assert_gate_balanced(&summary, 1)
    }

    #[tokio::test]
    async fn unreadable_subdirectory_does_not_hide_siblings() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if !permissions_enforced()? {
            eprintln!("skipping unreadable_subdirectory_does_not_hide_siblings: running as root");
            return Ok(());
        }
        let workspace = Workspace::new()?;
        workspace.write_sources(&["a.pyc", "locked/x.pyc", "open/b.pyc"])?;
        let locked = workspace.source().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000))?;
        let script = workspace.script("copy.sh", COPY_SCRIPT)?;

        let result = run_process(shell_config(&workspace, &script), &CancellationController::new()).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755))?;
        let summary = result?;

        assert_eq!(
            workspace.dest_files()?,
            vec![PathBuf::from("a.py"), PathBuf::from("open/b.py")]
        );
        assert!(summary.skipped_entries >= 1);
        assert_eq!(summary.succeeded, 2);
        Ok(())
    }
}
