//! Execution of a single job through an external transformer.
//!
//! # Design
//! - `Transformer` is the seam between orchestration and the process that does
//!   the work; tests substitute in-process implementations.
//! - The runner owns the admission permit for the job's whole lifetime.
//! - Deadlines and run cancellation both arrive through one stop token.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treemill_config::{CancelMode, RunConfig};
use treemill_telemetry::Metrics;

use crate::cancel::CancellationController;
use crate::error::JobError;
use crate::gate::AdmissionPermit;
use crate::job::{JobDescriptor, JobOutcome, JobReport};

const STDERR_TAIL_BYTES: usize = 4096;
const STDERR_GRACE: Duration = Duration::from_millis(250);

/// How a transformer invocation ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStatus {
    /// The destination was written.
    Completed,
    /// The stop token fired and the work was abandoned.
    Interrupted,
}

/// Performs the work for one job.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Transform `job.source()` into `job.destination()`, abandoning the work
    /// promptly once `stop` is cancelled.
    async fn transform(
        &self,
        job: &JobDescriptor,
        stop: &CancellationToken,
    ) -> Result<TransformStatus, JobError>;
}

/// Runs `<program> <args...> -o <destination> <source>` as a child process.
#[derive(Debug, Clone)]
pub struct CommandTransformer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTransformer {
    /// Transformer invoking `program` with no extra arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before `-o <destination> <source>`.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Transformer described by a run configuration.
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.transformer.clone()).with_args(config.transformer_args.clone())
    }

    fn command(&self, job: &JobDescriptor) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("-o")
            .arg(job.destination())
            .arg(job.source())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Transformer for CommandTransformer {
    async fn transform(
        &self,
        job: &JobDescriptor,
        stop: &CancellationToken,
    ) -> Result<TransformStatus, JobError> {
        if stop.is_cancelled() {
            return Ok(TransformStatus::Interrupted);
        }

        let mut child = self
            .command(job)
            .spawn()
            .map_err(|source| JobError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stderr = StderrTail::spawn(child.stderr.take());

        let status = tokio::select! {
            biased;
            () = stop.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let Some(status) = status else {
            if let Err(err) = child.kill().await {
                warn!(
                    source = %job.source().display(),
                    error = %err,
                    "failed to kill interrupted transformer"
                );
            }
            return Ok(TransformStatus::Interrupted);
        };

        let status = status.map_err(|source| JobError::Wait {
            program: self.program.clone(),
            source,
        })?;
        if status.success() {
            Ok(TransformStatus::Completed)
        } else {
            Err(JobError::ExitStatus {
                program: self.program.clone(),
                code: status.code(),
                stderr: stderr.finish(STDERR_GRACE).await,
            })
        }
    }
}

/// Trailing bytes of a child's stderr, collected by a side task.
///
/// Descendants of the transformer can inherit the pipe and hold it open after
/// the transformer exits, so the job never waits on EOF. The reader is aborted
/// when the tail is dropped.
struct StderrTail {
    reader: JoinHandle<()>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl StderrTail {
    fn spawn(stderr: Option<ChildStderr>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let reader = tokio::spawn(async move {
            let Some(mut stderr) = stderr else {
                return;
            };
            let mut chunk = [0_u8; 1024];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        let mut tail = sink.lock().unwrap_or_else(PoisonError::into_inner);
                        tail.extend_from_slice(&chunk[..read]);
                        if tail.len() > STDERR_TAIL_BYTES {
                            let excess = tail.len() - STDERR_TAIL_BYTES;
                            tail.drain(..excess);
                        }
                    }
                }
            }
        });
        Self { reader, buffer }
    }

    /// Wait up to `grace` for the pipe to close, then return what was read.
    async fn finish(mut self, grace: Duration) -> String {
        if tokio::time::timeout(grace, &mut self.reader).await.is_err() {
            debug!("stderr still open after transformer exit");
        }
        let tail = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&tail).trim().to_string()
    }
}

impl Drop for StderrTail {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Runs admitted jobs and turns every ending into a [`JobReport`].
pub struct JobRunner {
    transformer: Arc<dyn Transformer>,
    cancel: CancellationController,
    cancel_mode: CancelMode,
    job_timeout: Option<Duration>,
    metrics: Metrics,
}

impl JobRunner {
    /// Runner using `transformer`, observing `cancel`, reporting into `metrics`.
    #[must_use]
    pub fn new(
        transformer: Arc<dyn Transformer>,
        cancel: CancellationController,
        metrics: Metrics,
    ) -> Self {
        Self {
            transformer,
            cancel,
            cancel_mode: CancelMode::default(),
            job_timeout: None,
            metrics,
        }
    }

    /// Choose whether run cancellation interrupts in-flight jobs.
    #[must_use]
    pub const fn with_cancel_mode(mut self, mode: CancelMode) -> Self {
        self.cancel_mode = mode;
        self
    }

    /// Apply a deadline to every job.
    #[must_use]
    pub const fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Execute `job` while holding `permit`; the permit is released before returning.
    pub async fn run(self: Arc<Self>, job: JobDescriptor, permit: AdmissionPermit) -> JobReport {
        let started = Instant::now();
        let outcome = if self.cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else {
            let stop = match self.cancel_mode {
                CancelMode::Terminate => self.cancel.child_token(),
                CancelMode::Drain => CancellationToken::new(),
            };
            self.execute(&job, &stop).await
        };
        drop(permit);

        self.metrics.inc_job(outcome.label());
        let elapsed = started.elapsed();
        match &outcome {
            JobOutcome::Succeeded => {
                debug!(source = %job.source().display(), elapsed_ms = elapsed.as_millis(), "job succeeded");
            }
            JobOutcome::Failed(err) => {
                warn!(
                    source = %job.source().display(),
                    reason = err.reason(),
                    error = %err.detail(),
                    "job failed"
                );
            }
            JobOutcome::Cancelled => {
                debug!(source = %job.source().display(), "job cancelled");
            }
            JobOutcome::TimedOut { after } => {
                info!(
                    source = %job.source().display(),
                    timeout_ms = after.as_millis(),
                    "job exceeded its deadline"
                );
            }
        }
        JobReport::new(job, outcome, elapsed)
    }

    async fn execute(&self, job: &JobDescriptor, stop: &CancellationToken) -> JobOutcome {
        let transformer = Arc::clone(&self.transformer);
        let task_job = job.clone();
        let task_stop = stop.clone();
        let mut handle =
            tokio::spawn(async move { transformer.transform(&task_job, &task_stop).await });

        let Some(limit) = self.job_timeout else {
            return classify(handle.await);
        };
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => classify(joined),
            Err(_) => {
                stop.cancel();
                match handle.await {
                    Ok(Ok(TransformStatus::Interrupted)) => JobOutcome::TimedOut { after: limit },
                    finished => classify(finished),
                }
            }
        }
    }
}

fn classify(joined: Result<Result<TransformStatus, JobError>, JoinError>) -> JobOutcome {
    match joined {
        Ok(Ok(TransformStatus::Completed)) => JobOutcome::Succeeded,
        Ok(Ok(TransformStatus::Interrupted)) => JobOutcome::Cancelled,
        Ok(Err(err)) => JobOutcome::Failed(err),
        Err(err) => JobOutcome::Failed(JobError::Panicked {
            detail: err.to_string(),
        }),
    }
}
