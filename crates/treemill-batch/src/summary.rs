//! Aggregate outcome of a batch run.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use treemill_config::FailurePolicy;

use crate::error::JobError;
use crate::gate::GateSnapshot;
use crate::job::{JobDescriptor, JobOutcome, JobReport};

/// One failed or timed-out job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobFailure {
    /// Source file of the job.
    pub source: PathBuf,
    /// Source path relative to the source root.
    pub relative: PathBuf,
    /// Machine-readable failure reason.
    pub reason: &'static str,
    /// Human-readable detail.
    pub detail: String,
}

impl JobFailure {
    pub(crate) fn from_error(job: &JobDescriptor, error: &JobError) -> Self {
        Self {
            source: job.source().to_path_buf(),
            relative: job.relative().to_path_buf(),
            reason: error.reason(),
            detail: error.detail(),
        }
    }

    fn timed_out(job: &JobDescriptor, after: Duration) -> Self {
        Self {
            source: job.source().to_path_buf(),
            relative: job.relative().to_path_buf(),
            reason: "timed_out",
            detail: format!("job exceeded its {}ms deadline", after.as_millis()),
        }
    }
}

/// Counters and failures collected once every job has been joined.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Eligible files found by the walk.
    pub discovered: u64,
    /// Jobs admitted and spawned.
    pub dispatched: u64,
    /// Jobs whose transformer succeeded.
    pub succeeded: u64,
    /// Jobs that failed, including those whose destination could not be prepared.
    pub failed: u64,
    /// Jobs stopped by cancellation.
    pub cancelled_jobs: u64,
    /// Jobs stopped by their deadline.
    pub timed_out: u64,
    /// Discovered jobs never admitted because the run was cancelled.
    pub not_started: u64,
    /// Walk entries skipped because they could not be read.
    pub skipped_entries: u64,
    /// Details for every failed or timed-out job.
    pub failures: Vec<JobFailure>,
    /// Whether cancellation was triggered during the run.
    pub cancelled: bool,
    /// Final admission gate counters.
    pub gate: Option<GateSnapshot>,
    /// Wall time of the whole run.
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Fold one job report into the totals.
    pub fn record(&mut self, report: &JobReport) {
        match &report.outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Failed(err) => self.record_failure(&report.job, err),
            JobOutcome::Cancelled => self.cancelled_jobs += 1,
            JobOutcome::TimedOut { after } => {
                self.timed_out += 1;
                self.failures.push(JobFailure::timed_out(&report.job, *after));
            }
        }
    }

    /// Record a job that failed before or during execution.
    pub fn record_failure(&mut self, job: &JobDescriptor, error: &JobError) {
        self.failed += 1;
        self.failures.push(JobFailure::from_error(job, error));
    }

    /// Whether any job failed or timed out.
    #[must_use]
    pub const fn has_job_failures(&self) -> bool {
        self.failed > 0 || self.timed_out > 0
    }

    /// Whether `policy` turns this run into a failure.
    #[must_use]
    pub const fn should_fail(&self, policy: FailurePolicy) -> bool {
        matches!(policy, FailurePolicy::FailRun) && self.has_job_failures()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}
