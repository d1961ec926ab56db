//! # Design
//!
//! - Centralize application-level errors for bootstrap and the batch run.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Map each variant onto a process exit code in one place.

use std::error::Error as StdError;
use std::fmt::Write as _;

use thiserror::Error;
use treemill_batch::BatchError;
use treemill_config::ConfigError;
use treemill_telemetry::TelemetryError;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Exit status for a run that finished, whatever happened to individual jobs.
pub const EXIT_OK: i32 = 0;
/// Exit status for invalid arguments or configuration.
pub const EXIT_USAGE: i32 = 2;
/// Exit status for errors that stopped the run.
pub const EXIT_FATAL: i32 = 3;
/// Exit status for a finished run with failed jobs under the strict failure policy.
pub const EXIT_JOB_FAILURES: i32 = 4;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration was rejected.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: ConfigError,
    },
    /// Telemetry setup or export failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: TelemetryError,
    },
    /// The batch run stopped on a fatal error.
    #[error("batch operation failed")]
    Batch {
        /// Operation identifier.
        operation: &'static str,
        /// Source batch error.
        source: BatchError,
    },
}

impl AppError {
    pub(crate) const fn config(operation: &'static str, source: ConfigError) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(operation: &'static str, source: TelemetryError) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn batch(operation: &'static str, source: BatchError) -> Self {
        Self::Batch { operation, source }
    }

    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => EXIT_USAGE,
            Self::Telemetry { .. } | Self::Batch { .. } => EXIT_FATAL,
        }
    }

    /// One-line message for stderr including context fields and the source chain.
    #[must_use]
    pub fn display_message(&self) -> String {
        let mut message = self.to_string();
        match self {
            Self::Config { operation, source } => {
                let _ = write!(message, " ({operation})");
                let ConfigError::InvalidField {
                    field,
                    reason,
                    value,
                } = source;
                let _ = write!(message, ": {field} is {reason}");
                if let Some(value) = value {
                    let _ = write!(message, " ({value})");
                }
                return message;
            }
            Self::Telemetry { operation, .. } => {
                let _ = write!(message, " ({operation})");
            }
            Self::Batch { operation, source } => {
                let _ = write!(message, " ({operation})");
                if let Some(path) = batch_path(source) {
                    let _ = write!(message, ": {}", path.display());
                }
            }
        }
        let mut current = self.source();
        while let Some(err) = current {
            let _ = write!(message, ": {err}");
            current = err.source();
        }
        message
    }
}

fn batch_path(err: &BatchError) -> Option<&std::path::Path> {
    match err {
        BatchError::SourceRootInvalid { path, .. }
        | BatchError::SourceRootUnreadable { path, .. }
        | BatchError::DestinationRoot { path, .. } => Some(path),
        _ => None,
    }
}
