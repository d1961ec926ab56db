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

//! treemill application wiring.
//!
//! Layout: `cli.rs` (argument parsing), `bootstrap.rs` (logging, signals, run),
//! `error.rs` (`AppError` and exit codes).

/// Logging, signal wiring and run orchestration.
pub mod bootstrap;
/// Command-line arguments.
pub mod cli;
/// Application error type and exit codes.
pub mod error;

pub use bootstrap::{RunOutcome, run_app, run_batch};
pub use cli::Cli;
pub use error::{AppError, AppResult};
