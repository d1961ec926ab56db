//! Bounded-parallelism batch execution over a discovered source tree.
//!
//! Layout: `cancel.rs` (run-wide cancellation), `gate.rs` (admission limiter),
//! `job.rs` (descriptors and reports), `discover.rs` (tree walk),
//! `runner.rs` (transformer invocation), `dispatch.rs` (orchestration),
//! `summary.rs` (run aggregate), `error.rs` (error types).
#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod discover;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod job;
pub mod runner;
pub mod summary;

pub use cancel::CancellationController;
pub use discover::{Discovery, DiscoveryRules, WalkEnd, prepare_destination, walk_tree};
pub use dispatch::BatchRunner;
pub use error::{BatchError, BatchResult, JobError};
pub use gate::{AdmissionGate, AdmissionPermit, GateSnapshot};
pub use job::{JobDescriptor, JobOutcome, JobReport};
pub use runner::{CommandTransformer, JobRunner, TransformStatus, Transformer};
pub use summary::{JobFailure, RunSummary};
