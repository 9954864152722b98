//! Error types for the durable execution engine.
//!
//! The engine distinguishes four kinds of failure:
//!
//! - **Ordinary step errors** ([`DurableError::UserCode`]) go through the retry
//!   policy and end up either as a durable `Fail` checkpoint or as a
//!   `Retry` checkpoint followed by suspension.
//! - **Interrupted steps** ([`DurableError::StepInterrupted`]) are synthesized when
//!   an at-most-once step is found `Started` on replay. They also go through the
//!   retry policy.
//! - **Unrecoverable execution errors** (serialization failures, replay
//!   mismatches, [`DurableError::Unrecoverable`]) abort the logical execution
//!   and are never retried.
//! - **Unrecoverable invocation errors** ([`DurableError::Checkpoint`]) abort the
//!   current invocation only and surface as a hard error from the driver.
//!
//! Suspension is not a failure. It travels through `?` as
//! [`DurableError::Suspended`] and becomes [`Outcome::Suspended`](crate::Outcome)
//! at the driver.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::termination::TerminationDetails;

/// Result alias used by every durable operation.
pub type DurableResult<T> = Result<T, DurableError>;

/// Error type returned by user step functions.
///
/// Boxing a [`DurableError::Unrecoverable`] into this type tags the failure as
/// unrecoverable; the step handler then skips the retry policy.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for the engine.
#[derive(Debug, Error)]
pub enum DurableError {
    /// Execution error that fails the logical execution.
    #[error("Execution error: {message}")]
    Execution {
        /// Error message describing what went wrong
        message: String,
        /// The reason for termination
        termination_reason: TerminationReason,
    },

    /// Invocation error; only the current invocation is lost.
    #[error("Invocation error: {message}")]
    Invocation {
        /// Error message describing what went wrong
        message: String,
        /// The reason for termination
        termination_reason: TerminationReason,
    },

    /// The checkpoint pipeline could not durably record a batch.
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        /// Error message describing what went wrong
        message: String,
    },

    /// Callback error for callback-specific failures.
    #[error("Callback error: {message}")]
    Callback {
        /// Error message describing what went wrong
        message: String,
        /// The callback ID if available
        callback_id: Option<String>,
    },

    /// Non-deterministic execution error for replay mismatches.
    #[error("Non-deterministic execution: {message}")]
    NonDeterministic {
        /// Error message describing the mismatch
        message: String,
        /// The operation ID where the mismatch occurred
        operation_id: Option<String>,
    },

    /// Validation error for invalid configuration or arguments.
    #[error("Validation error: {message}")]
    Validation {
        /// Error message describing the validation failure
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    SerDes {
        /// Error message describing the serialization failure
        message: String,
    },

    /// A step attempt started but never reached a terminal state.
    #[error("Step interrupted: operation {operation_id} attempt {attempt} did not complete")]
    StepInterrupted {
        /// The interrupted step
        operation_id: String,
        /// The attempt that was interrupted (1-based)
        attempt: u32,
    },

    /// Orphaned child error when a child operation's parent has completed.
    #[error("Orphaned child: {message}")]
    OrphanedChild {
        /// Error message describing the orphaned state
        message: String,
        /// The operation ID of the orphaned child
        operation_id: String,
    },

    /// User code error wrapping errors from user-provided closures.
    #[error("User code error: {message}")]
    UserCode {
        /// Error message from the user code
        message: String,
        /// The type of error
        error_type: String,
        /// Optional stack trace
        stack_trace: Option<String>,
    },

    /// An error that must bypass retries and terminate with the given reason.
    #[error("Unrecoverable error ({reason:?}): {message}")]
    Unrecoverable {
        /// The termination reason to report
        reason: TerminationReason,
        /// Error message
        message: String,
    },

    /// The invocation is suspended; the workflow continues in a later invocation.
    #[error("Execution suspended ({:?}): {}", .0.reason, .0.message)]
    Suspended(TerminationDetails),
}

impl DurableError {
    /// Creates a new Execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            termination_reason: TerminationReason::ExecutionError,
        }
    }

    /// Creates a new Invocation error.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation {
            message: message.into(),
            termination_reason: TerminationReason::InvocationError,
        }
    }

    /// Creates a new Checkpoint error.
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    /// Creates a new Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Creates an error that terminates the invocation with `reason`, skipping retries.
    pub fn unrecoverable(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self::Unrecoverable {
            reason,
            message: message.into(),
        }
    }

    /// Creates a user code error with the given type.
    pub fn user_code(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UserCode {
            message: message.into(),
            error_type: error_type.into(),
            stack_trace: None,
        }
    }

    /// Converts an error returned by a step function.
    ///
    /// A boxed `DurableError` is unwrapped as-is so that tags such as
    /// [`DurableError::Unrecoverable`] survive the trip through user code.
    pub fn from_step_error(error: StepError) -> Self {
        match error.downcast::<DurableError>() {
            Ok(durable) => *durable,
            Err(other) => Self::UserCode {
                message: other.to_string(),
                error_type: "StepError".to_string(),
                stack_trace: None,
            },
        }
    }

    /// Returns true if this is a suspension signal.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    /// Returns true if this is a checkpoint failure.
    pub fn is_checkpoint_failure(&self) -> bool {
        matches!(self, Self::Checkpoint { .. })
    }

    /// Returns the termination reason for errors that must bypass the retry policy.
    pub fn unrecoverable_reason(&self) -> Option<TerminationReason> {
        match self {
            Self::Unrecoverable { reason, .. } => Some(*reason),
            Self::SerDes { .. } => Some(TerminationReason::SerdesFailed),
            Self::NonDeterministic { .. } => Some(TerminationReason::NonDeterministicExecution),
            Self::Checkpoint { .. } => Some(TerminationReason::CheckpointFailed),
            _ => None,
        }
    }

    /// Returns the suspension details if this is a suspension signal.
    pub fn suspension(&self) -> Option<&TerminationDetails> {
        match self {
            Self::Suspended(details) => Some(details),
            _ => None,
        }
    }
}

/// Reason for ending an invocation early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TerminationReason {
    /// Generic termination requested by an operation
    #[default]
    OperationTerminated,
    /// A step failed and will be retried after a delay
    RetryScheduled,
    /// An interrupted step will be retried after a delay
    RetryInterruptedStep,
    /// A wait has not elapsed yet
    WaitScheduled,
    /// A callback has not been completed yet
    CallbackPending,
    /// The checkpoint pipeline failed
    CheckpointFailed,
    /// Serialization/deserialization failed
    SerdesFailed,
    /// Non-deterministic execution detected
    NonDeterministicExecution,
    /// The context was used incorrectly
    ContextValidationError,
    /// Error during invocation
    InvocationError,
    /// Explicit execution error
    ExecutionError,
}

impl TerminationReason {
    /// True for reasons that must fail the invocation instead of reporting `Pending`.
    pub fn is_invocation_fatal(&self) -> bool {
        matches!(self, Self::CheckpointFailed | Self::InvocationError)
    }

    /// True for reasons that permanently fail the logical execution.
    pub fn is_execution_fatal(&self) -> bool {
        matches!(
            self,
            Self::SerdesFailed
                | Self::NonDeterministicExecution
                | Self::ContextValidationError
                | Self::ExecutionError
        )
    }
}

/// Structured error payload stored in checkpoints and invocation responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error type/name
    #[serde(rename = "errorType")]
    pub error_type: String,
    /// The error message
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    /// Optional stack trace
    #[serde(rename = "stackTrace", skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorObject {
    /// Creates a new ErrorObject.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
        }
    }

    /// Rebuilds the error a replayed failure rethrows.
    pub fn to_durable_error(&self) -> DurableError {
        DurableError::UserCode {
            message: self.error_message.clone(),
            error_type: self.error_type.clone(),
            stack_trace: self.stack_trace.clone(),
        }
    }
}

impl From<&DurableError> for ErrorObject {
    fn from(error: &DurableError) -> Self {
        match error {
            DurableError::Execution { message, .. } => ErrorObject::new("ExecutionError", message),
            DurableError::Invocation { message, .. } => ErrorObject::new("InvocationError", message),
            DurableError::Checkpoint { message } => ErrorObject::new("CheckpointError", message),
            DurableError::Callback { message, .. } => ErrorObject::new("CallbackError", message),
            DurableError::NonDeterministic { message, .. } => {
                ErrorObject::new("NonDeterministicExecutionError", message)
            }
            DurableError::Validation { message } => ErrorObject::new("ValidationError", message),
            DurableError::SerDes { message } => ErrorObject::new("SerDesError", message),
            DurableError::StepInterrupted { .. } => {
                ErrorObject::new("StepInterruptedError", error.to_string())
            }
            DurableError::OrphanedChild { message, .. } => {
                ErrorObject::new("OrphanedChildError", message)
            }
            DurableError::UserCode {
                message,
                error_type,
                stack_trace,
            } => {
                let mut obj = ErrorObject::new(error_type, message);
                obj.stack_trace = stack_trace.clone();
                obj
            }
            DurableError::Unrecoverable { message, .. } => {
                ErrorObject::new("UnrecoverableError", message)
            }
            DurableError::Suspended(details) => {
                ErrorObject::new("SuspendExecution", &details.message)
            }
        }
    }
}

impl From<serde_json::Error> for DurableError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes {
            message: error.to_string(),
        }
    }
}
