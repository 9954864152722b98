//! One-shot suspension signal and the explicit operation outcome.
//!
//! Any operation that has to pause the workflow (a scheduled retry, a wait, a
//! pending callback, a failed checkpoint) calls [`TerminationSignal::terminate`]
//! and hands [`DurableError::Suspended`] back to its caller. The invocation
//! driver races the user handler against [`TerminationSignal::fired`].
//!
//! The first call to `terminate` wins. Later calls do not overwrite the
//! recorded details; they receive the winning details instead, so every
//! suspended branch reports the same reason the driver acts on.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{DurableError, TerminationReason};

/// Hook run by the driver once the invocation has been suspended.
pub type CleanupFn = Arc<dyn Fn() + Send + Sync>;

/// Why the invocation is ending early.
#[derive(Clone)]
pub struct TerminationDetails {
    /// The reason for termination
    pub reason: TerminationReason,
    /// Human-readable explanation
    pub message: String,
    /// Optional cleanup hook
    pub cleanup: Option<CleanupFn>,
}

impl TerminationDetails {
    /// Creates details without a cleanup hook.
    pub fn new(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            cleanup: None,
        }
    }

    /// Attaches a cleanup hook.
    pub fn with_cleanup(mut self, cleanup: CleanupFn) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Runs the cleanup hook, if any.
    pub fn run_cleanup(&self) {
        if let Some(ref cleanup) = self.cleanup {
            cleanup();
        }
    }
}

impl std::fmt::Debug for TerminationDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationDetails")
            .field("reason", &self.reason)
            .field("message", &self.message)
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Per-invocation, first-call-wins termination flag.
pub struct TerminationSignal {
    slot: watch::Sender<Option<TerminationDetails>>,
}

impl TerminationSignal {
    /// Creates an unfired signal.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Fires the signal with `reason` unless it already fired.
    ///
    /// Returns the details that are in effect after the call, which are the
    /// caller's own only if it was first.
    pub fn terminate(&self, reason: TerminationReason, message: impl Into<String>) -> TerminationDetails {
        self.terminate_with(TerminationDetails::new(reason, message))
    }

    /// Fires the signal with fully built details unless it already fired.
    pub fn terminate_with(&self, details: TerminationDetails) -> TerminationDetails {
        let mut candidate = Some(details);
        let first = self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = candidate.take();
            true
        });
        if first {
            tracing::debug!(
                reason = ?self.slot.borrow().as_ref().map(|d| d.reason),
                "Termination signal fired"
            );
        }
        match self.details() {
            Some(winner) => winner,
            // The slot is never cleared once set.
            None => candidate.unwrap_or_else(|| {
                TerminationDetails::new(TerminationReason::OperationTerminated, "terminated")
            }),
        }
    }

    /// Fires the signal and returns the suspension error to hand back to the caller.
    pub fn suspend(&self, reason: TerminationReason, message: impl Into<String>) -> DurableError {
        DurableError::Suspended(self.terminate(reason, message))
    }

    /// Returns true once the signal has fired.
    pub fn is_terminated(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Returns the winning details, if the signal has fired.
    pub fn details(&self) -> Option<TerminationDetails> {
        self.slot.borrow().clone()
    }

    /// Resolves with the winning details once the signal fires.
    pub async fn fired(&self) -> TerminationDetails {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(details) = rx.borrow_and_update().clone() {
                return details;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so this branch is unreachable while borrowed.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationSignal")
            .field("details", &*self.slot.borrow())
            .finish()
    }
}

/// The explicit result of running durable code.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The code finished with a value
    Completed(T),
    /// The code finished with an error
    Failed(DurableError),
    /// The code must continue in a later invocation
    Suspended(TerminationDetails),
}

impl<T> Outcome<T> {
    /// Returns true for [`Outcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns true for [`Outcome::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true for [`Outcome::Suspended`].
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    /// Converts back into a `Result`, re-wrapping suspension as an error.
    pub fn into_result(self) -> Result<T, DurableError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(error) => Err(error),
            Self::Suspended(details) => Err(DurableError::Suspended(details)),
        }
    }
}

impl<T> From<Result<T, DurableError>> for Outcome<T> {
    fn from(result: Result<T, DurableError>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(DurableError::Suspended(details)) => Self::Suspended(details),
            Err(error) => Self::Failed(error),
        }
    }
}
