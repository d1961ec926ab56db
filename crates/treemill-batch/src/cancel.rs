//! Run-wide cancellation shared by discovery, admission and job execution.
//!
//! # Design
//! - Wraps a `CancellationToken`; once triggered it never resets.
//! - Only the first trigger records a reason and logs.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;

/// Cloneable handle onto the single cancellation signal of a run.
#[derive(Clone, Debug, Default)]
pub struct CancellationController {
    token: CancellationToken,
    reason: Arc<OnceCell<String>>,
}

impl CancellationController {
    /// Create an untriggered controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation. Returns `true` only for the call that triggered it.
    pub fn cancel(&self, reason: &str) -> bool {
        let first = self.reason.set(reason.to_string()).is_ok();
        self.token.cancel();
        if first {
            info!(reason, "cancellation requested; no new jobs will start");
        }
        first
    }

    /// Non-blocking check used at every walk step and before each spawn.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Future resolving once cancellation has been triggered.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Reason recorded by the triggering call, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Derived token cancelled with the run, or earlier on its own (deadlines).
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
