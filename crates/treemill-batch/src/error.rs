//! # Design
//!
//! - `BatchError` covers failures that abort the whole run; `JobError` covers one job.
//! - Messages stay constant; paths and programs travel as context fields.
//! - Source errors are preserved rather than interpolated.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for batch orchestration.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors that stop a run or an admission request.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The source root is missing or not a directory.
    #[error("source root is not a usable directory")]
    SourceRootInvalid {
        /// Configured source root.
        path: PathBuf,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Underlying IO error when the root could not be inspected.
        source: Option<io::Error>,
    },
    /// The source root could not be read at all.
    #[error("source root could not be walked")]
    SourceRootUnreadable {
        /// Configured source root.
        path: PathBuf,
        /// Underlying walkdir error.
        source: walkdir::Error,
    },
    /// The destination root could not be created.
    #[error("destination root could not be created")]
    DestinationRoot {
        /// Configured destination root.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Cancellation was requested before a slot was granted.
    #[error("run cancelled")]
    Cancelled,
    /// The admission semaphore was closed underneath a waiting request.
    #[error("admission gate closed")]
    AdmissionClosed,
    /// The blocking walker task failed to complete.
    #[error("tree walker task failed")]
    WalkerJoin {
        /// Underlying join error.
        source: tokio::task::JoinError,
    },
}

impl BatchError {
    /// Whether the error represents a deliberate stop rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors scoped to a single job; never fatal to the run.
#[derive(Debug, Error)]
pub enum JobError {
    /// The destination parent directory could not be created.
    #[error("failed to prepare destination directory")]
    PrepareDestination {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The transformer process could not be started.
    #[error("failed to spawn transformer")]
    Spawn {
        /// Transformer executable.
        program: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Waiting on the transformer process failed.
    #[error("failed to wait for transformer")]
    Wait {
        /// Transformer executable.
        program: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The transformer exited unsuccessfully.
    #[error("transformer exited unsuccessfully")]
    ExitStatus {
        /// Transformer executable.
        program: PathBuf,
        /// Exit code, absent when the process died from a signal.
        code: Option<i32>,
        /// Trailing stderr output captured from the process.
        stderr: String,
    },
    /// The job task panicked.
    #[error("job task panicked")]
    Panicked {
        /// Panic detail reported by the runtime.
        detail: String,
    },
}

impl JobError {
    /// Machine-readable reason used in summaries and metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::PrepareDestination { .. } => "prepare_destination",
            Self::Spawn { .. } => "spawn",
            Self::Wait { .. } => "wait",
            Self::ExitStatus { .. } => "exit_status",
            Self::Panicked { .. } => "panicked",
        }
    }

    /// One-line description including the most useful context field.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::PrepareDestination { path, source } => {
                format!("{self}: {}: {source}", path.display())
            }
            Self::Spawn { program, source } | Self::Wait { program, source } => {
                format!("{self}: {}: {source}", program.display())
            }
            Self::ExitStatus {
                program,
                code,
                stderr,
            } => {
                let code = code.map_or_else(|| "signal".to_string(), |code| code.to_string());
                if stderr.is_empty() {
                    format!("{self}: {} (exit {code})", program.display())
                } else {
                    format!("{self}: {} (exit {code}): {stderr}", program.display())
                }
            }
            Self::Panicked { detail } => format!("{self}: {detail}"),
        }
    }
}
