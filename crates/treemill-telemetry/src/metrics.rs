//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges a batch run needs to explain itself.

use std::convert::TryFrom;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Outcome label attached to `jobs_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcomeLabel {
    /// Transformer exited successfully.
    Succeeded,
    /// Job failed to prepare, spawn, or exited non-zero.
    Failed,
    /// Job stopped because the run was cancelled.
    Cancelled,
    /// Job exceeded its deadline.
    TimedOut,
}

impl JobOutcomeLabel {
    /// Label value used in the exposition output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Prometheus-backed metrics registry shared across the batch.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    jobs_total: IntCounterVec,
    jobs_discovered_total: IntCounter,
    walk_entry_errors_total: IntCounter,
    admission_outstanding: IntGauge,
    admission_wait_ms: IntGauge,
}

/// Snapshot of selected gauges and counters for run summaries.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Eligible files discovered by the walk.
    pub jobs_discovered_total: u64,
    /// Jobs whose transformer exited successfully.
    pub jobs_succeeded_total: u64,
    /// Jobs that failed.
    pub jobs_failed_total: u64,
    /// Jobs stopped by cancellation.
    pub jobs_cancelled_total: u64,
    /// Jobs stopped by their deadline.
    pub jobs_timed_out_total: u64,
    /// Walk entries that could not be inspected.
    pub walk_entry_errors_total: u64,
    /// Jobs currently holding an admission slot.
    pub admission_outstanding: i64,
    /// Latest time (ms) spent waiting for an admission slot.
    pub admission_wait_ms: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("treemill_jobs_total", "Transformer jobs finished by outcome"),
            &["outcome"],
        )
        .map_err(|source| TelemetryError::MetricsCollector {
            name: "treemill_jobs_total",
            source,
        })?;
        let jobs_discovered_total = IntCounter::with_opts(Opts::new(
            "treemill_jobs_discovered_total",
            "Eligible files discovered by the tree walk",
        ))
        .map_err(|source| TelemetryError::MetricsCollector {
            name: "treemill_jobs_discovered_total",
            source,
        })?;
        let walk_entry_errors_total = IntCounter::with_opts(Opts::new(
            "treemill_walk_entry_errors_total",
            "Directory entries skipped because they could not be inspected",
        ))
        .map_err(|source| TelemetryError::MetricsCollector {
            name: "treemill_walk_entry_errors_total",
            source,
        })?;
        let admission_outstanding = IntGauge::with_opts(Opts::new(
            "treemill_admission_outstanding",
            "Jobs currently holding an admission slot",
        ))
        .map_err(|source| TelemetryError::MetricsCollector {
            name: "treemill_admission_outstanding",
            source,
        })?;
        let admission_wait_ms = IntGauge::with_opts(Opts::new(
            "treemill_admission_wait_ms",
            "Latest time spent waiting for an admission slot (ms)",
        ))
        .map_err(|source| TelemetryError::MetricsCollector {
            name: "treemill_admission_wait_ms",
            source,
        })?;

        register(&registry, "treemill_jobs_total", jobs_total.clone())?;
        register(
            &registry,
            "treemill_jobs_discovered_total",
            jobs_discovered_total.clone(),
        )?;
        register(
            &registry,
            "treemill_walk_entry_errors_total",
            walk_entry_errors_total.clone(),
        )?;
        register(
            &registry,
            "treemill_admission_outstanding",
            admission_outstanding.clone(),
        )?;
        register(
            &registry,
            "treemill_admission_wait_ms",
            admission_wait_ms.clone(),
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                jobs_total,
                jobs_discovered_total,
                walk_entry_errors_total,
                admission_outstanding,
                admission_wait_ms,
            }),
        })
    }

    /// Increment the finished-job counter for the given outcome.
    pub fn inc_job(&self, outcome: JobOutcomeLabel) {
        self.inner
            .jobs_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Increment the discovered-job counter.
    pub fn inc_discovered(&self) {
        self.inner.jobs_discovered_total.inc();
    }

    /// Increment the skipped walk entry counter.
    pub fn inc_walk_entry_error(&self) {
        self.inner.walk_entry_errors_total.inc();
    }

    /// Set the outstanding admission gauge.
    pub fn set_admission_outstanding(&self, outstanding: usize) {
        self.inner
            .admission_outstanding
            .set(i64::try_from(outstanding).unwrap_or(i64::MAX));
    }

    /// Record how long the latest admission request waited.
    pub fn observe_admission_wait(&self, duration: Duration) {
        self.inner
            .admission_wait_ms
            .set(Self::duration_to_ms(duration));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Render the registry and write it to `path`, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails or the file cannot be written.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let rendered = self.render()?;
        fs::write(path, rendered).map_err(|source| TelemetryError::MetricsWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Take a point-in-time snapshot of the batch counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let jobs = |outcome: JobOutcomeLabel| {
            self.inner
                .jobs_total
                .with_label_values(&[outcome.as_str()])
                .get()
        };
        MetricsSnapshot {
            jobs_discovered_total: self.inner.jobs_discovered_total.get(),
            jobs_succeeded_total: jobs(JobOutcomeLabel::Succeeded),
            jobs_failed_total: jobs(JobOutcomeLabel::Failed),
            jobs_cancelled_total: jobs(JobOutcomeLabel::Cancelled),
            jobs_timed_out_total: jobs(JobOutcomeLabel::TimedOut),
            walk_entry_errors_total: self.inner.walk_entry_errors_total.get(),
            admission_outstanding: self.inner.admission_outstanding.get(),
            admission_wait_ms: self.inner.admission_wait_ms.get(),
        }
    }

    /// Convert a duration to milliseconds saturating at `i64::MAX`.
    pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

fn register<C>(registry: &Registry, name: &'static str, collector: C) -> Result<()>
where
    C: prometheus::core::Collector + 'static,
{
    registry
        .register(Box::new(collector))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}
