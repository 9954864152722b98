//! Operation records and checkpoint updates.
//!
//! [`Operation`] is what the backend has durably recorded for an id;
//! [`OperationUpdate`] is one pending write the engine sends through the
//! checkpoint pipeline. Both use the camelCase wire schema.

use serde::{Deserialize, Serialize};

use crate::error::ErrorObject;

/// A durably recorded operation.
///
/// Once `status` is `Succeeded` or `Failed` for an id, the record is terminal:
/// replays return or rethrow it without running user code again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Wire id (hash of the logical step id)
    #[serde(rename = "id")]
    pub operation_id: String,

    /// The type of operation
    #[serde(rename = "type")]
    pub operation_type: OperationType,

    /// Finer-grained kind, e.g. `Map` for a context running a map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<OperationSubType>,

    /// Current status of the operation
    pub status: OperationStatus,

    /// Serialized result if the operation succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Error details if the operation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,

    /// Parent operation ID for nested operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Optional human-readable name for the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Step-specific details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_details: Option<StepDetails>,

    /// Context-specific details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_details: Option<ContextDetails>,

    /// Wait-specific details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_details: Option<WaitDetails>,

    /// Callback-specific details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_details: Option<CallbackDetails>,

    /// Execution-specific details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_details: Option<ExecutionDetails>,
}

impl Operation {
    /// Creates a new `Started` operation with the given ID and type.
    pub fn new(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type,
            sub_type: None,
            status: OperationStatus::Started,
            result: None,
            error: None,
            parent_id: None,
            name: None,
            step_details: None,
            context_details: None,
            wait_details: None,
            callback_details: None,
            execution_details: None,
        }
    }

    /// Sets the status.
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the serialized result.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Sets the error payload.
    pub fn with_error(mut self, error: ErrorObject) -> Self {
        self.error = Some(error);
        self
    }

    /// Sets the parent ID for this operation.
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the name for this operation.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the backend-recorded attempt count.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.step_details.get_or_insert_with(StepDetails::default).attempt = Some(attempt);
        self
    }

    /// Returns true if the operation reached a terminal state.
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the operation succeeded.
    pub fn is_succeeded(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }

    /// Returns true if the operation failed.
    pub fn is_failed(&self) -> bool {
        self.status.is_failure()
    }

    /// Returns the number of attempts the backend has recorded for a step.
    pub fn attempt(&self) -> u32 {
        self.step_details
            .as_ref()
            .and_then(|d| d.attempt)
            .unwrap_or(0)
    }

    /// Returns the callback id assigned by the backend, if any.
    pub fn callback_id(&self) -> Option<&str> {
        self.callback_details
            .as_ref()
            .and_then(|d| d.callback_id.as_deref())
    }

    /// Returns true if a context's result was too large and must be rebuilt by replaying its children.
    pub fn replays_children(&self) -> bool {
        self.context_details
            .as_ref()
            .and_then(|d| d.replay_children)
            .unwrap_or(false)
    }
}

/// The type of operation in a durable execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// The root execution operation
    Execution,
    /// A step operation (unit of work)
    Step,
    /// A wait/sleep operation
    Wait,
    /// A callback operation waiting for an external signal
    Callback,
    /// A chained invocation of another durable function
    ChainedInvoke,
    /// A context operation for nested child contexts
    Context,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "Execution"),
            Self::Step => write!(f, "Step"),
            Self::Wait => write!(f, "Wait"),
            Self::Callback => write!(f, "Callback"),
            Self::ChainedInvoke => write!(f, "ChainedInvoke"),
            Self::Context => write!(f, "Context"),
        }
    }
}

/// Finer-grained operation kind recorded alongside the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationSubType {
    /// Plain step
    Step,
    /// Plain wait
    Wait,
    /// Plain callback
    Callback,
    /// User-created child context
    RunInChildContext,
    /// Context running a map
    Map,
    /// One map item
    MapIteration,
    /// Context running parallel branches
    Parallel,
    /// One parallel branch
    ParallelBranch,
    /// Context running a bounded concurrent execution
    ConcurrentExecution,
    /// One item of a bounded concurrent execution
    ConcurrentItem,
    /// Context running wait-for-callback
    WaitForCallback,
    /// Step that hands the callback id to an external system
    CallbackSubmitter,
}

/// The status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Operation has started but not completed
    Started,
    /// A retry was scheduled and its delay has not elapsed
    Pending,
    /// A retry was scheduled and is due
    Ready,
    /// Operation completed successfully
    Succeeded,
    /// Operation failed with an error
    Failed,
    /// Operation was cancelled
    Cancelled,
    /// Operation timed out
    TimedOut,
    /// Operation was stopped externally
    Stopped,
}

impl OperationStatus {
    /// Returns true if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started | Self::Pending | Self::Ready)
    }

    /// Returns true if this status represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if this status represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::TimedOut | Self::Stopped)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "Started"),
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::TimedOut => write!(f, "TimedOut"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Action to perform on an operation during checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationAction {
    /// Start a new operation (or a new attempt)
    Start,
    /// Mark operation as succeeded
    Succeed,
    /// Mark operation as failed
    Fail,
    /// Record a failed attempt and schedule another one
    Retry,
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Succeed => write!(f, "Succeed"),
            Self::Fail => write!(f, "Fail"),
            Self::Retry => write!(f, "Retry"),
        }
    }
}

/// Step details recorded by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDetails {
    /// Number of attempts recorded so far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// When the next attempt is due, as reported by the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_timestamp: Option<String>,
}

/// Context details recorded by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextDetails {
    /// True when the stored result is a sentinel and children must be replayed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_children: Option<bool>,
}

/// Wait details recorded by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitDetails {
    /// When the wait ends, as reported by the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_end_timestamp: Option<String>,
}

/// Callback details recorded by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackDetails {
    /// Id external systems use to complete the callback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
}

/// Execution details recorded by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetails {
    /// The original user input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_payload: Option<String>,
}

/// Options sent with a step `Retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOptions {
    /// Seconds until the next attempt
    pub next_attempt_delay_seconds: u64,
}

/// Options sent with a wait `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOptions {
    /// Seconds to wait
    pub wait_seconds: u64,
}

/// Options sent with a callback `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackOptions {
    /// Overall timeout; zero means none
    pub timeout_seconds: u64,
    /// Heartbeat timeout; zero means none
    pub heartbeat_timeout_seconds: u64,
}

/// Options sent with a context `Succeed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptions {
    /// Rebuild the result by replaying children instead of reading the payload
    pub replay_children: bool,
}

/// One pending checkpoint write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUpdate {
    /// Wire id of the operation
    #[serde(rename = "id")]
    pub operation_id: String,

    /// The action to perform
    pub action: OperationAction,

    /// The type of operation
    #[serde(rename = "type")]
    pub operation_type: OperationType,

    /// Finer-grained kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<OperationSubType>,

    /// Serialized payload (result for `Succeed`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Error payload (for `Fail` and `Retry`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,

    /// Parent operation ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Options for step retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_options: Option<StepOptions>,

    /// Options for waits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_options: Option<WaitOptions>,

    /// Options for callbacks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_options: Option<CallbackOptions>,

    /// Options for contexts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_options: Option<ContextOptions>,
}

impl OperationUpdate {
    fn with_action(
        operation_id: impl Into<String>,
        action: OperationAction,
        operation_type: OperationType,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            action,
            operation_type,
            sub_type: None,
            payload: None,
            error: None,
            parent_id: None,
            name: None,
            step_options: None,
            wait_options: None,
            callback_options: None,
            context_options: None,
        }
    }

    /// Creates a `Start` update.
    pub fn start(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::with_action(operation_id, OperationAction::Start, operation_type)
    }

    /// Creates a `Succeed` update carrying an optional serialized payload.
    pub fn succeed(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        payload: Option<String>,
    ) -> Self {
        let mut update = Self::with_action(operation_id, OperationAction::Succeed, operation_type);
        update.payload = payload;
        update
    }

    /// Creates a `Fail` update.
    pub fn fail(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        error: ErrorObject,
    ) -> Self {
        let mut update = Self::with_action(operation_id, OperationAction::Fail, operation_type);
        update.error = Some(error);
        update
    }

    /// Creates a step `Retry` update scheduling the next attempt after `delay_seconds`.
    pub fn retry(operation_id: impl Into<String>, error: ErrorObject, delay_seconds: u64) -> Self {
        let mut update =
            Self::with_action(operation_id, OperationAction::Retry, OperationType::Step);
        update.error = Some(error);
        update.step_options = Some(StepOptions {
            next_attempt_delay_seconds: delay_seconds,
        });
        update
    }

    /// Sets the parent ID.
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the sub type.
    pub fn with_sub_type(mut self, sub_type: OperationSubType) -> Self {
        self.sub_type = Some(sub_type);
        self
    }

    /// Sets wait options.
    pub fn with_wait_seconds(mut self, wait_seconds: u64) -> Self {
        self.wait_options = Some(WaitOptions { wait_seconds });
        self
    }

    /// Sets callback options.
    pub fn with_callback_options(mut self, options: CallbackOptions) -> Self {
        self.callback_options = Some(options);
        self
    }

    /// Marks a context result as rebuilt-on-replay.
    pub fn with_replay_children(mut self) -> Self {
        self.context_options = Some(ContextOptions {
            replay_children: true,
        });
        self
    }

    /// Rough serialized size, used for batch accounting.
    pub fn estimated_size(&self) -> usize {
        100 + self.operation_id.len()
            + self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
            + self
                .error
                .as_ref()
                .map(|e| e.error_message.len() + e.error_type.len())
                .unwrap_or(0)
            + self.parent_id.as_ref().map(|p| p.len()).unwrap_or(0)
            + self.name.as_ref().map(|n| n.len()).unwrap_or(0)
    }
}
