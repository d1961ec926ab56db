//! Orchestration of one batch run.
//!
//! # Design
//! - The walker runs on a blocking thread and feeds a bounded channel; this task
//!   admits each job through the gate and spawns it into a `JoinSet`.
//! - Every spawned job is joined before `run` returns, including on fatal errors.
//! - Cancellation is a normal stop: the summary says so and no error is returned.
//! - A runner executes one batch; its gate is closed once dispatching ends.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use treemill_config::RunConfig;
use treemill_telemetry::{JobOutcomeLabel, Metrics};

use crate::cancel::CancellationController;
use crate::discover::{Discovery, DiscoveryRules, WalkEnd, walk_tree};
use crate::error::{BatchError, BatchResult, JobError};
use crate::gate::AdmissionGate;
use crate::job::{JobDescriptor, JobReport};
use crate::runner::{CommandTransformer, JobRunner, Transformer};
use crate::summary::RunSummary;

/// Discoveries buffered between the walker and the dispatcher.
const DISCOVERY_BUFFER: usize = 1;

/// Runs one batch: walk, admit, execute, join, summarise.
pub struct BatchRunner {
    config: RunConfig,
    gate: AdmissionGate,
    transformer: Arc<dyn Transformer>,
    metrics: Metrics,
}

impl BatchRunner {
    /// Runner for a validated configuration using the configured command transformer.
    #[must_use]
    pub fn new(config: RunConfig, metrics: Metrics) -> Self {
        let transformer: Arc<dyn Transformer> = Arc::new(CommandTransformer::from_config(&config));
        Self {
            gate: AdmissionGate::new(config.capacity),
            config,
            transformer,
            metrics,
        }
    }

    /// Replace the transformer, e.g. with an in-process implementation.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Execute the batch and return its summary once every job has finished.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchError`] when the source or destination root is unusable,
    /// the walker task fails, or admission breaks down (including a second
    /// run on the same runner, whose gate is already closed). Job failures and
    /// cancellation are reported through the summary instead.
    pub async fn run(&self, cancel: &CancellationController) -> BatchResult<RunSummary> {
        let started = Instant::now();
        ensure_source_root(&self.config.source_root).await?;
        tokio::fs::create_dir_all(&self.config.dest_root)
            .await
            .map_err(|source| BatchError::DestinationRoot {
                path: self.config.dest_root.clone(),
                source,
            })?;

        info!(
            source = %self.config.source_root.display(),
            dest = %self.config.dest_root.display(),
            transformer = %self.config.transformer.display(),
            capacity = self.gate.capacity(),
            cancel_mode = self.config.cancel_mode.as_str(),
            "batch run starting"
        );

        let runner = Arc::new(
            JobRunner::new(
                Arc::clone(&self.transformer),
                cancel.clone(),
                self.metrics.clone(),
            )
            .with_cancel_mode(self.config.cancel_mode)
            .with_job_timeout(self.config.job_timeout),
        );

        let (tx, mut rx) = mpsc::channel(DISCOVERY_BUFFER);
        let walker = {
            let rules = DiscoveryRules::from_config(&self.config);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || walk_tree(&rules, &cancel, &tx))
        };

        let mut summary = RunSummary::default();
        let mut jobs = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut fatal = None;

        while let Some(item) = rx.recv().await {
            let Some(job) = self.triage(item, &mut summary) else {
                continue;
            };
            match self.gate.acquire(cancel).await {
                Ok(permit) => {
                    self.metrics.observe_admission_wait(permit.waited());
                    self.metrics
                        .set_admission_outstanding(self.gate.outstanding());
                    debug!(source = %job.source().display(), "job admitted");
                    summary.dispatched += 1;
                    let handle = jobs.spawn(Arc::clone(&runner).run(job.clone(), permit));
                    in_flight.insert(handle.id(), job);
                }
                Err(err) if err.is_cancelled() => {
                    summary.not_started += 1;
                    break;
                }
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }
            while let Some(joined) = jobs.try_join_next_with_id() {
                self.collect(&mut summary, &mut in_flight, joined);
            }
        }
        self.gate.close();

        // Anything still buffered was discovered but will never be admitted.
        rx.close();
        while let Some(item) = rx.recv().await {
            if self.triage(item, &mut summary).is_some() {
                summary.not_started += 1;
            }
        }

        match walker.await {
            Ok(Ok(WalkEnd::Completed)) => debug!("walk completed"),
            Ok(Ok(end)) => debug!(?end, "walk stopped early"),
            Ok(Err(err)) => fatal = fatal.or(Some(err)),
            Err(source) => fatal = fatal.or(Some(BatchError::WalkerJoin { source })),
        }

        while let Some(joined) = jobs.join_next_with_id().await {
            self.collect(&mut summary, &mut in_flight, joined);
        }

        summary.cancelled = cancel.is_cancelled();
        summary.gate = Some(self.gate.snapshot());
        summary.elapsed = started.elapsed();

        if let Some(err) = fatal {
            error!(error = %err, dispatched = summary.dispatched, "batch run aborted");
            return Err(err);
        }

        info!(
            discovered = summary.discovered,
            succeeded = summary.succeeded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            cancelled_jobs = summary.cancelled_jobs,
            not_started = summary.not_started,
            skipped_entries = summary.skipped_entries,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis(),
            "batch run finished"
        );
        Ok(summary)
    }

    /// Account for a discovery, returning the job if it should be admitted.
    fn triage(&self, item: Discovery, summary: &mut RunSummary) -> Option<JobDescriptor> {
        match item {
            Discovery::Job(job) => {
                summary.discovered += 1;
                self.metrics.inc_discovered();
                Some(job)
            }
            Discovery::Unprepared { job, error } => {
                summary.discovered += 1;
                self.metrics.inc_discovered();
                self.record_unprepared(&job, &error, summary);
                None
            }
            Discovery::EntryError { .. } => {
                summary.skipped_entries += 1;
                self.metrics.inc_walk_entry_error();
                None
            }
        }
    }

    fn record_unprepared(&self, job: &JobDescriptor, error: &JobError, summary: &mut RunSummary) {
        warn!(
            source = %job.source().display(),
            reason = error.reason(),
            error = %error.detail(),
            "job failed"
        );
        self.metrics.inc_job(JobOutcomeLabel::Failed);
        summary.record_failure(job, error);
    }

    fn collect(
        &self,
        summary: &mut RunSummary,
        in_flight: &mut HashMap<Id, JobDescriptor>,
        joined: Result<(Id, JobReport), JoinError>,
    ) {
        match joined {
            Ok((id, report)) => {
                in_flight.remove(&id);
                summary.record(&report);
            }
            Err(err) => {
                error!(error = %err, "job task did not complete");
                if let Some(job) = in_flight.remove(&err.id()) {
                    self.metrics.inc_job(JobOutcomeLabel::Failed);
                    let error = JobError::Panicked {
                        detail: err.to_string(),
                    };
                    summary.record_failure(&job, &error);
                }
            }
        }
        self.metrics
            .set_admission_outstanding(self.gate.outstanding());
    }
}

async fn ensure_source_root(path: &Path) -> BatchResult<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| BatchError::SourceRootInvalid {
            path: path.to_path_buf(),
            reason: if source.kind() == io::ErrorKind::NotFound {
                "missing"
            } else {
                "unreadable"
            },
            source: Some(source),
        })?;
    if !metadata.is_dir() {
        return Err(BatchError::SourceRootInvalid {
            path: path.to_path_buf(),
            reason: "not_a_directory",
            source: None,
        });
    }
    Ok(())
}
