//! Typed configuration models for a batch run.
//!
//! # Design
//! - Pure data carriers; the binary fills them from CLI flags and environment.
//! - Defaults reproduce the classic `.pyc` -> `.py` decompilation batch.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigResult;
use crate::validate;

/// Transformer binary used when none is configured.
pub const DEFAULT_TRANSFORMER: &str = "decompyle3";
/// Extension of files the transformer consumes.
pub const DEFAULT_INPUT_EXTENSION: &str = "pyc";
/// Extension written for each transformed file.
pub const DEFAULT_OUTPUT_EXTENSION: &str = "py";

/// Admission capacity derived from host parallelism.
#[must_use]
pub fn default_capacity() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// What happens to running transformer processes once the run is cancelled.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CancelMode {
    /// Kill in-flight transformer processes promptly.
    #[default]
    Terminate,
    /// Let in-flight transformer processes finish; start nothing new.
    Drain,
}

impl CancelMode {
    /// Render the mode as its lowercase string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::Drain => "drain",
        }
    }
}

/// Whether per-job failures change the overall outcome of a run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Failed jobs are reported; the run itself still succeeds.
    #[default]
    Report,
    /// Any failed or timed-out job fails the run.
    FailRun,
}

impl FailurePolicy {
    /// Render the policy as its `snake_case` string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::FailRun => "fail_run",
        }
    }
}

/// Everything a batch run needs to know before it starts.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunConfig {
    /// Root of the tree scanned for eligible files.
    pub source_root: PathBuf,
    /// Root of the mirrored output tree.
    pub dest_root: PathBuf,
    /// Transformer executable, resolved through `PATH` when relative.
    pub transformer: PathBuf,
    /// Arguments inserted before `-o <dest> <src>` on every invocation.
    pub transformer_args: Vec<String>,
    /// Extension (without dot) that makes a file eligible.
    pub input_extension: String,
    /// Extension (without dot) given to each destination file.
    pub output_extension: String,
    /// Maximum number of jobs executing at once.
    pub capacity: usize,
    /// Optional deadline applied to each transformer invocation.
    pub job_timeout: Option<Duration>,
    /// Behaviour of in-flight jobs after cancellation.
    pub cancel_mode: CancelMode,
    /// Effect of job failures on the run outcome.
    pub failure_policy: FailurePolicy,
}

impl RunConfig {
    /// Build a configuration with default settings for the given roots.
    #[must_use]
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            transformer: PathBuf::from(DEFAULT_TRANSFORMER),
            transformer_args: Vec::new(),
            input_extension: DEFAULT_INPUT_EXTENSION.to_string(),
            output_extension: DEFAULT_OUTPUT_EXTENSION.to_string(),
            capacity: default_capacity(),
            job_timeout: None,
            cancel_mode: CancelMode::default(),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Override the transformer executable.
    #[must_use]
    pub fn with_transformer(mut self, transformer: impl Into<PathBuf>) -> Self {
        self.transformer = transformer.into();
        self
    }

    /// Override the admission capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Override the input and output extensions.
    #[must_use]
    pub fn with_extensions(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_extension = input.into();
        self.output_extension = output.into();
        self
    }

    /// Apply a per-job deadline.
    #[must_use]
    pub const fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Override the cancellation behaviour.
    #[must_use]
    pub const fn with_cancel_mode(mut self, mode: CancelMode) -> Self {
        self.cancel_mode = mode;
        self
    }

    /// Override the failure policy.
    #[must_use]
    pub const fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Normalise extensions and check every field, returning the cleaned config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] naming the first field that fails validation.
    pub fn validated(mut self) -> ConfigResult<Self> {
        self.input_extension =
            validate::normalize_extension("input_extension", &self.input_extension)?;
        self.output_extension =
            validate::normalize_extension("output_extension", &self.output_extension)?;
        validate::validate_run_config(&self)?;
        Ok(self)
    }
}
