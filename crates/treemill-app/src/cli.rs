//! Command-line surface of the `treemill` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use treemill_config::{
    CancelMode, ConfigResult, DEFAULT_INPUT_EXTENSION, DEFAULT_OUTPUT_EXTENSION,
    DEFAULT_TRANSFORMER, FailurePolicy, RunConfig,
};
use treemill_telemetry::{DEFAULT_LOG_LEVEL, LogFormat};

/// Run an external transformer over every matching file in a directory tree.
#[derive(Debug, Parser)]
#[command(name = "treemill", version, about)]
pub struct Cli {
    /// Directory scanned for eligible files.
    pub source: PathBuf,
    /// Directory receiving the mirrored output tree.
    pub dest: PathBuf,
    /// Transformer executable, invoked as `<bin> -o <dest> <src>`.
    #[arg(long, env = "TREEMILL_BIN_PATH", default_value = DEFAULT_TRANSFORMER)]
    pub bin_path: PathBuf,
    /// Extra argument placed before `-o`; repeat for several.
    #[arg(long = "bin-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub bin_args: Vec<String>,
    /// Extension of files to transform.
    #[arg(long, default_value = DEFAULT_INPUT_EXTENSION)]
    pub input_ext: String,
    /// Extension given to transformed files.
    #[arg(long, default_value = DEFAULT_OUTPUT_EXTENSION)]
    pub output_ext: String,
    /// Maximum number of transformer processes at once (default: available parallelism).
    #[arg(long, env = "TREEMILL_JOBS")]
    pub jobs: Option<usize>,
    /// Kill a transformer that runs longer than this many seconds.
    #[arg(long, value_name = "SECS")]
    pub job_timeout_secs: Option<u64>,
    /// What happens to running transformers when the run is interrupted.
    #[arg(long, value_enum, default_value_t = CancelArg::Terminate)]
    pub on_cancel: CancelArg,
    /// Exit with status 4 when any job fails or times out.
    #[arg(
        long,
        env = "TREEMILL_FAIL_ON_JOB_ERROR",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    pub fail_on_job_error: bool,
    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
    /// Log output format (default depends on the build profile).
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormatArg>,
    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long, value_name = "PATH")]
    pub metrics_out: Option<PathBuf>,
}

/// `--on-cancel` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CancelArg {
    /// Kill running transformers.
    Terminate,
    /// Let running transformers finish.
    Drain,
}

impl From<CancelArg> for CancelMode {
    fn from(value: CancelArg) -> Self {
        match value {
            CancelArg::Terminate => Self::Terminate,
            CancelArg::Drain => Self::Drain,
        }
    }
}

/// `--log-format` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

impl Cli {
    /// Selected log format, inferred from the build profile when not given.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.map_or_else(LogFormat::infer, LogFormat::from)
    }

    /// Failure policy selected by `--fail-on-job-error`.
    #[must_use]
    pub const fn failure_policy(&self) -> FailurePolicy {
        if self.fail_on_job_error {
            FailurePolicy::FailRun
        } else {
            FailurePolicy::Report
        }
    }

    /// Build and validate the run configuration described by the arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`treemill_config::ConfigError`] naming the first invalid setting.
    pub fn run_config(&self) -> ConfigResult<RunConfig> {
        let mut config = RunConfig::new(&self.source, &self.dest)
            .with_transformer(&self.bin_path)
            .with_extensions(&self.input_ext, &self.output_ext)
            .with_job_timeout(self.job_timeout_secs.map(Duration::from_secs))
            .with_cancel_mode(self.on_cancel.into())
            .with_failure_policy(self.failure_policy());
        if let Some(jobs) = self.jobs {
            config = config.with_capacity(jobs);
        }
        config.transformer_args.clone_from(&self.bin_args);
        config.validated()
    }
}
