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

//! Typed run configuration for treemill batches.
//!
//! Layout: `model.rs` (run configuration and policy enums), `validate.rs`
//! (normalisation and validation helpers), `error.rs` (`ConfigError`).

pub mod error;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use model::{
    CancelMode, DEFAULT_INPUT_EXTENSION, DEFAULT_OUTPUT_EXTENSION, DEFAULT_TRANSFORMER,
    FailurePolicy, RunConfig, default_capacity,
};
pub use validate::normalize_extension;
