//! Source tree walk producing job descriptors.
//!
//! # Design
//! - Runs synchronously on a blocking thread; items flow out over a bounded
//!   channel so a full admission gate throttles the walk.
//! - Destination parents are created here, before a job is emitted.
//! - Only an unreadable root aborts the walk; other entry errors are reported and skipped.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use treemill_config::RunConfig;
use walkdir::WalkDir;

use crate::cancel::CancellationController;
use crate::error::{BatchError, BatchResult, JobError};
use crate::job::JobDescriptor;

#[cfg(unix)]
const DESTINATION_DIR_MODE: u32 = 0o775;

/// Path mapping rules for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRules {
    source_root: PathBuf,
    dest_root: PathBuf,
    input_extension: String,
    output_extension: String,
}

impl DiscoveryRules {
    /// Build rules directly; extensions are expected without a leading dot.
    #[must_use]
    pub fn new(
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        input_extension: impl Into<String>,
        output_extension: impl Into<String>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            input_extension: input_extension.into(),
            output_extension: output_extension.into(),
        }
    }

    /// Derive rules from a validated run configuration.
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.source_root.clone(),
            config.dest_root.clone(),
            config.input_extension.clone(),
            config.output_extension.clone(),
        )
    }

    /// Root of the walk.
    #[must_use]
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Whether `path` carries the input extension (case-sensitive).
    #[must_use]
    pub fn is_eligible(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|ext| ext == self.input_extension.as_str())
    }

    /// Map an eligible source file to its job, or `None` if it lies outside the root.
    #[must_use]
    pub fn descriptor_for(&self, source: &Path) -> Option<JobDescriptor> {
        let relative = source.strip_prefix(&self.source_root).ok()?;
        if relative.as_os_str().is_empty() {
            return None;
        }
        let destination = self
            .dest_root
            .join(relative)
            .with_extension(&self.output_extension);
        Some(JobDescriptor::new(source, destination, relative))
    }
}

/// Item produced by the walk.
#[derive(Debug)]
pub enum Discovery {
    /// Eligible file whose destination directory is ready.
    Job(JobDescriptor),
    /// Eligible file whose destination directory could not be created.
    Unprepared {
        /// Job that will not be admitted.
        job: JobDescriptor,
        /// Why the destination could not be prepared.
        error: JobError,
    },
    /// Entry that could not be inspected and was skipped.
    EntryError {
        /// Offending path when walkdir reports one.
        path: Option<PathBuf>,
        /// Rendered walkdir error.
        detail: String,
    },
}

/// How a walk that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// Every entry was visited.
    Completed,
    /// Cancellation was observed before the walk finished.
    Cancelled,
    /// The dispatcher stopped listening.
    ReceiverClosed,
}

/// Walk the source tree and push discoveries into `tx`, blocking when it is full.
///
/// Must run on a blocking thread.
///
/// # Errors
///
/// Returns [`BatchError::SourceRootUnreadable`] when the root itself cannot be read.
pub fn walk_tree(
    rules: &DiscoveryRules,
    cancel: &CancellationController,
    tx: &mpsc::Sender<Discovery>,
) -> BatchResult<WalkEnd> {
    for entry in WalkDir::new(&rules.source_root) {
        if cancel.is_cancelled() {
            debug!("walk stopped by cancellation");
            return Ok(WalkEnd::Cancelled);
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(source) if source.depth() == 0 => {
                return Err(BatchError::SourceRootUnreadable {
                    path: rules.source_root.clone(),
                    source,
                });
            }
            Err(err) => {
                let path = err.path().map(Path::to_path_buf);
                warn!(
                    path = ?path,
                    error = %err,
                    "skipping entry that could not be read"
                );
                let item = Discovery::EntryError {
                    path,
                    detail: err.to_string(),
                };
                if tx.blocking_send(item).is_err() {
                    return Ok(WalkEnd::ReceiverClosed);
                }
                continue;
            }
        };

        if entry.file_type().is_dir() || !rules.is_eligible(entry.path()) {
            continue;
        }
        let Some(job) = rules.descriptor_for(entry.path()) else {
            continue;
        };

        let item = match prepare_destination(job.destination()) {
            Ok(()) => Discovery::Job(job),
            Err(error) => Discovery::Unprepared { job, error },
        };
        if tx.blocking_send(item).is_err() {
            return Ok(WalkEnd::ReceiverClosed);
        }
    }
    Ok(WalkEnd::Completed)
}

/// Create the parent chain of `destination`; an existing directory is success.
///
/// # Errors
///
/// Returns [`JobError::PrepareDestination`] naming the directory that could not be created.
pub fn prepare_destination(destination: &Path) -> Result<(), JobError> {
    let Some(parent) = destination.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DESTINATION_DIR_MODE);
    }
    builder
        .create(parent)
        .map_err(|source| JobError::PrepareDestination {
            path: parent.to_path_buf(),
            source,
        })
}
