//! Job descriptors and per-job reports.

use std::path::{Path, PathBuf};
use std::time::Duration;

use treemill_telemetry::JobOutcomeLabel;

use crate::error::JobError;

/// One unit of work: transform `source` into `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    source: PathBuf,
    destination: PathBuf,
    relative: PathBuf,
}

impl JobDescriptor {
    /// Build a descriptor; `relative` is `source` stripped of the source root.
    #[must_use]
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        relative: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            relative: relative.into(),
        }
    }

    /// Eligible file handed to the transformer.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// File the transformer is asked to write.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Source path relative to the source root.
    #[must_use]
    pub fn relative(&self) -> &Path {
        &self.relative
    }
}

/// Terminal state of one job.
#[derive(Debug)]
pub enum JobOutcome {
    /// The transformer exited with status 0.
    Succeeded,
    /// The job could not be prepared or the transformer failed.
    Failed(JobError),
    /// The run was cancelled before or while the job ran.
    Cancelled,
    /// The job exceeded the per-job deadline.
    TimedOut {
        /// Configured deadline that expired.
        after: Duration,
    },
}

impl JobOutcome {
    /// Metrics label for this outcome.
    #[must_use]
    pub const fn label(&self) -> JobOutcomeLabel {
        match self {
            Self::Succeeded => JobOutcomeLabel::Succeeded,
            Self::Failed(_) => JobOutcomeLabel::Failed,
            Self::Cancelled => JobOutcomeLabel::Cancelled,
            Self::TimedOut { .. } => JobOutcomeLabel::TimedOut,
        }
    }
}

/// Result of one job, returned through its task handle.
#[derive(Debug)]
pub struct JobReport {
    /// Job that was run.
    pub job: JobDescriptor,
    /// How it ended.
    pub outcome: JobOutcome,
    /// Wall time from admission to completion.
    pub elapsed: Duration,
}

impl JobReport {
    /// Convenience constructor.
    #[must_use]
    pub const fn new(job: JobDescriptor, outcome: JobOutcome, elapsed: Duration) -> Self {
        Self {
            job,
            outcome,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels_match_metrics() {
        let failed = JobOutcome::Failed(JobError::Panicked {
            detail: "boom".to_string(),
        });
        let timed_out = JobOutcome::TimedOut {
            after: Duration::from_secs(1),
        };
        assert_eq!(failed.label(), JobOutcomeLabel::Failed);
        assert_eq!(timed_out.label(), JobOutcomeLabel::TimedOut);
        assert_eq!(JobOutcome::Cancelled.label(), JobOutcomeLabel::Cancelled);
        assert_eq!(JobOutcome::Succeeded.label(), JobOutcomeLabel::Succeeded);
    }

    #[test]
    fn descriptor_exposes_paths() {
        let job = JobDescriptor::new("in/sub/b.pyc", "out/sub/b.py", "sub/b.pyc");
        assert_eq!(job.source(), Path::new("in/sub/b.pyc"));
        assert_eq!(job.destination(), Path::new("out/sub/b.py"));
        assert_eq!(job.relative(), Path::new("sub/b.pyc"));
    }
}
