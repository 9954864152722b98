//! Invocation driver and the invocation payload types.
//!
//! One invocation replays the workflow from the top: the driver builds the
//! execution state and its checkpoint pipeline, runs the user handler against
//! the termination signal, and turns whichever finishes first into a response:
//!
//! | Outcome                                 | Response                      |
//! |-----------------------------------------|-------------------------------|
//! | handler returned a value                | `SUCCEEDED` with the result   |
//! | handler returned an error               | `FAILED` with an error object |
//! | suspended (retry, wait, callback, ...)  | `PENDING`                     |
//! | suspended on serdes / non-determinism   | `FAILED`                      |
//! | checkpoint or state-load failure        | `Err` from the driver         |
//!
//! Every response is sent only after all enqueued checkpoints are durable.

use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::client::SharedDurableServiceClient;
use crate::config::ExecutionConfig;
use crate::context::DurableContext;
use crate::error::{DurableError, DurableResult, ErrorObject, TerminationReason};
use crate::operation::{Operation, OperationType, OperationUpdate};
use crate::state::ExecutionState;
use crate::termination::{Outcome, TerminationDetails, TerminationSignal};

/// Input payload for one invocation of a durable execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableExecutionInvocationInput {
    /// The id of the durable execution
    #[serde(rename = "DurableExecutionArn")]
    pub execution_id: String,

    /// Token used for the first checkpoint call
    #[serde(rename = "CheckpointToken")]
    pub checkpoint_token: String,

    /// First page of previously checkpointed operations
    #[serde(rename = "InitialExecutionState", default)]
    pub initial_execution_state: InitialExecutionState,

    /// The user's original input payload
    #[serde(rename = "Input", default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

/// Previously checkpointed operations delivered with the invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialExecutionState {
    /// List of previously checkpointed operations
    #[serde(rename = "Operations", default)]
    pub operations: Vec<Operation>,

    /// Marker for the next page, if the backend has more
    #[serde(rename = "NextMarker", default, skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

impl InitialExecutionState {
    /// Creates a single-page state with the given operations.
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            operations,
            next_marker: None,
        }
    }

    /// Returns true if there are more operations to load.
    pub fn has_more(&self) -> bool {
        self.next_marker.is_some()
    }
}

/// Status reported for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    /// The execution completed successfully
    Succeeded,
    /// The execution failed
    Failed,
    /// The execution continues in a later invocation
    Pending,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}

/// Response payload for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableExecutionInvocationOutput {
    /// The status of the invocation
    #[serde(rename = "Status")]
    pub status: InvocationStatus,

    /// The serialized result; absent when it was checkpointed instead
    #[serde(rename = "Result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Error details if the execution failed
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl DurableExecutionInvocationOutput {
    /// Largest result carried inline in a response (6 MiB).
    pub const MAX_RESPONSE_SIZE: usize = 6 * 1024 * 1024;

    /// Creates a new output indicating successful completion.
    pub fn succeeded(result: Option<String>) -> Self {
        Self {
            status: InvocationStatus::Succeeded,
            result,
            error: None,
        }
    }

    /// Creates a new output indicating failure.
    pub fn failed(error: ErrorObject) -> Self {
        Self {
            status: InvocationStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    /// Creates a new output indicating pending/suspended execution.
    pub fn pending() -> Self {
        Self {
            status: InvocationStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Returns true if the invocation succeeded.
    pub fn is_succeeded(&self) -> bool {
        matches!(self.status, InvocationStatus::Succeeded)
    }

    /// Returns true if the invocation failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, InvocationStatus::Failed)
    }

    /// Returns true if the invocation is pending.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, InvocationStatus::Pending)
    }
}

/// Runs one invocation of `handler` and reports how it ended.
///
/// Returns `Err` only for invocation-fatal conditions: the recorded state
/// could not be loaded, or a checkpoint could not be made durable. The
/// backend retries such invocations from the last durable checkpoint.
pub async fn run_durable_invocation<E, R, F, Fut>(
    input: DurableExecutionInvocationInput,
    client: SharedDurableServiceClient,
    config: ExecutionConfig,
    handler: F,
) -> Result<DurableExecutionInvocationOutput, DurableError>
where
    E: DeserializeOwned,
    R: Serialize,
    F: FnOnce(E, DurableContext) -> Fut,
    Fut: Future<Output = DurableResult<R>>,
{
    let execution_id = input.execution_id.clone();
    let shutdown_timeout = config.shutdown_timeout;
    let termination = Arc::new(TerminationSignal::new());
    let (state, batcher) = ExecutionState::with_pipeline(
        input.execution_id,
        input.checkpoint_token,
        input.initial_execution_state,
        client,
        termination.clone(),
        config,
    );
    let batcher_handle = tokio::spawn(batcher.run());
    let state = Arc::new(state);

    tracing::info!(
        execution_id = %execution_id,
        replay = state.is_replay(),
        "Starting invocation"
    );
    let output = drive(&state, &termination, input.input, handler).await;
    match output {
        Ok(ref response) => {
            tracing::info!(execution_id = %execution_id, status = %response.status, "Invocation finished")
        }
        Err(ref error) => {
            tracing::error!(execution_id = %execution_id, error = %error, "Invocation aborted")
        }
    }

    drop(state);
    match tokio::time::timeout(shutdown_timeout, batcher_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(join_error)) => {
            tracing::warn!(execution_id = %execution_id, error = %join_error, "Checkpoint batcher panicked")
        }
        Err(_) => tracing::warn!(
            execution_id = %execution_id,
            timeout = ?shutdown_timeout,
            "Checkpoint batcher still running at shutdown"
        ),
    }

    output
}

async fn drive<E, R, F, Fut>(
    state: &Arc<ExecutionState>,
    termination: &TerminationSignal,
    input: Option<serde_json::Value>,
    handler: F,
) -> Result<DurableExecutionInvocationOutput, DurableError>
where
    E: DeserializeOwned,
    R: Serialize,
    F: FnOnce(E, DurableContext) -> Fut,
    Fut: Future<Output = DurableResult<R>>,
{
    state.load_all_operations().await.map_err(|error| DurableError::Invocation {
        message: format!("Failed to load execution state: {}", error),
        termination_reason: TerminationReason::InvocationError,
    })?;

    let event = match decode_event::<E>(state, input) {
        Ok(event) => event,
        Err(error) => {
            settle(state).await?;
            return Ok(DurableExecutionInvocationOutput::failed(ErrorObject::from(&error)));
        }
    };

    let ctx = DurableContext::new(state.clone());
    let outcome: Outcome<R> = tokio::select! {
        biased;
        details = termination.fired() => Outcome::Suspended(details),
        result = handler(event, ctx) => Outcome::from(result),
    };

    // A fired signal wins even when user code swallowed the suspension.
    if let Some(details) = termination.details() {
        if !outcome.is_suspended() {
            tracing::warn!(
                execution_id = %state.execution_id(),
                reason = ?details.reason,
                "Handler returned after the invocation was suspended"
            );
        }
        return route_suspension(state, details).await;
    }

    match outcome {
        Outcome::Suspended(details) => route_suspension(state, details).await,
        Outcome::Completed(value) => complete(state, &value).await,
        Outcome::Failed(error) => {
            if error.is_checkpoint_failure() {
                return Err(invocation_error(TerminationReason::CheckpointFailed, error.to_string()));
            }
            settle(state).await?;
            tracing::warn!(execution_id = %state.execution_id(), error = %error, "Handler failed");
            Ok(DurableExecutionInvocationOutput::failed(ErrorObject::from(&error)))
        }
    }
}

/// Picks the event from the invocation input, falling back to the recorded execution input.
fn decode_event<E: DeserializeOwned>(
    state: &ExecutionState,
    input: Option<serde_json::Value>,
) -> DurableResult<E> {
    let decoded = match (input, state.original_input_raw()) {
        (Some(value), _) => serde_json::from_value(value),
        (None, Some(raw)) => serde_json::from_str(raw),
        (None, None) => serde_json::from_value(serde_json::Value::Null),
    };
    decoded.map_err(|e| DurableError::serdes(format!("Failed to decode execution input: {}", e)))
}

async fn route_suspension(
    state: &ExecutionState,
    details: TerminationDetails,
) -> Result<DurableExecutionInvocationOutput, DurableError> {
    let reason = details.reason;
    if reason.is_invocation_fatal() {
        return Err(invocation_error(reason, details.message));
    }
    settle(state).await?;

    if reason.is_execution_fatal() {
        tracing::error!(
            execution_id = %state.execution_id(),
            reason = ?reason,
            message = %details.message,
            "Execution cannot continue"
        );
        return Ok(DurableExecutionInvocationOutput::failed(ErrorObject::new(
            format!("{:?}", reason),
            details.message,
        )));
    }

    tracing::debug!(
        execution_id = %state.execution_id(),
        reason = ?reason,
        message = %details.message,
        "Suspending invocation"
    );
    details.run_cleanup();
    Ok(DurableExecutionInvocationOutput::pending())
}

async fn complete<R: Serialize>(
    state: &ExecutionState,
    value: &R,
) -> Result<DurableExecutionInvocationOutput, DurableError> {
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(e) => {
            settle(state).await?;
            return Ok(DurableExecutionInvocationOutput::failed(ErrorObject::new(
                "SerDesError",
                format!("Failed to serialize execution result: {}", e),
            )));
        }
    };

    let result = if payload.len() > DurableExecutionInvocationOutput::MAX_RESPONSE_SIZE {
        tracing::debug!(
            execution_id = %state.execution_id(),
            size = payload.len(),
            "Result exceeds response limit, checkpointing it"
        );
        let execution_op_id = state
            .execution_operation()
            .map(|op| op.operation_id.clone())
            .unwrap_or_else(|| state.execution_id().to_string());
        state
            .checkpoint_sync(OperationUpdate::succeed(
                execution_op_id,
                OperationType::Execution,
                Some(payload),
            ))
            .await
            .map_err(|e| invocation_error(TerminationReason::CheckpointFailed, e.to_string()))?;
        None
    } else {
        Some(payload)
    };

    settle(state).await?;
    Ok(DurableExecutionInvocationOutput::succeeded(result))
}

/// Waits until every enqueued checkpoint is durable.
async fn settle(state: &ExecutionState) -> Result<(), DurableError> {
    if let Err(error) = state.drain().await {
        return Err(invocation_error(TerminationReason::CheckpointFailed, error.to_string()));
    }
    match state.termination().details() {
        Some(details) if details.reason.is_invocation_fatal() => {
            Err(invocation_error(details.reason, details.message))
        }
        _ => Ok(()),
    }
}

fn invocation_error(reason: TerminationReason, message: impl Into<String>) -> DurableError {
    DurableError::Invocation {
        message: message.into(),
        termination_reason: reason,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::client::MockDurableServiceClient;
    use crate::config::ModeFlags;
    use crate::duration::Duration;
    use crate::error::StepError;
    use crate::operation::{ExecutionDetails, OperationAction, OperationStatus};

    fn local_config() -> ExecutionConfig {
        ExecutionConfig::default().with_mode(ModeFlags {
            local: true,
            ..Default::default()
        })
    }

    fn input(operations: Vec<Operation>, event: Option<serde_json::Value>) -> DurableExecutionInvocationInput {
        DurableExecutionInvocationInput {
            execution_id: "exec-1".to_string(),
            checkpoint_token: "token-0".to_string(),
            initial_execution_state: InitialExecutionState::new(operations),
            input: event,
        }
    }

    #[test]
    fn test_input_deserialization() {
        let json = r#"{
            "DurableExecutionArn": "arn:exec:1",
            "CheckpointToken": "tok",
            "InitialExecutionState": {
                "Operations": [{"id": "op-1", "type": "Step", "status": "Succeeded"}],
                "NextMarker": "page-2"
            },
            "Input": {"orderId": 7}
        }"#;
        let input: DurableExecutionInvocationInput = serde_json::from_str(json).unwrap();
        assert_eq!(input.execution_id, "arn:exec:1");
        assert_eq!(input.initial_execution_state.operations.len(), 1);
        assert!(input.initial_execution_state.has_more());
        assert_eq!(input.input.unwrap()["orderId"], 7);
    }

    #[test]
    fn test_output_serialization() {
        let json = serde_json::to_value(DurableExecutionInvocationOutput::pending()).unwrap();
        assert_eq!(json, serde_json::json!({"Status": "PENDING"}));
        assert_eq!(InvocationStatus::Succeeded.to_string(), "SUCCEEDED");
    }

    #[tokio::test]
    async fn test_completed_handler_succeeds() {
        let client = Arc::new(MockDurableServiceClient::new());

        let output = run_durable_invocation(
            input(vec![], Some(serde_json::json!({"amount": 20}))),
            client.clone(),
            local_config(),
            |event: serde_json::Value, ctx| async move {
                let doubled: u64 = ctx
                    .step(move |_| async move { Ok::<_, StepError>(event["amount"].as_u64().unwrap_or(0) * 2) }, None)
                    .await?;
                Ok(doubled)
            },
        )
        .await
        .unwrap();

        assert!(output.is_succeeded());
        assert_eq!(output.result.as_deref(), Some("40"));
        let actions: Vec<OperationAction> = client.all_updates().iter().map(|u| u.action).collect();
        assert_eq!(actions, vec![OperationAction::Start, OperationAction::Succeed]);
    }

    #[tokio::test]
    async fn test_wait_reports_pending() {
        let client = Arc::new(MockDurableServiceClient::new());

        let output = run_durable_invocation(
            input(vec![], None),
            client.clone(),
            local_config(),
            |_: serde_json::Value, ctx| async move {
                ctx.wait(Duration::from_hours(1)).await?;
                Ok("done")
            },
        )
        .await
        .unwrap();

        assert!(output.is_pending());
        assert_eq!(client.all_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_reports_failed() {
        let output = run_durable_invocation(
            input(vec![], None),
            Arc::new(MockDurableServiceClient::new()),
            local_config(),
            |_: serde_json::Value, _ctx| async move {
                Err::<(), _>(DurableError::user_code("OrderRejected", "out of stock"))
            },
        )
        .await
        .unwrap();

        assert!(output.is_failed());
        let error = output.error.unwrap();
        assert_eq!(error.error_message, "out of stock");
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_a_hard_error() {
        let client = Arc::new(
            MockDurableServiceClient::new()
                .with_checkpoint_response(Err(DurableError::invocation("backend unavailable"))),
        );

        let error = run_durable_invocation(
            input(vec![], None),
            client,
            local_config(),
            |_: serde_json::Value, ctx| async move {
                ctx.step(|_| async { Ok::<_, StepError>(1u32) }, None).await
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            error,
            DurableError::Invocation {
                termination_reason: TerminationReason::CheckpointFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_determinism_reports_failed() {
        let output = run_durable_invocation(
            input(
                vec![Operation::new("1", OperationType::Wait).with_status(OperationStatus::Succeeded)],
                None,
            ),
            Arc::new(MockDurableServiceClient::new()),
            local_config(),
            |_: serde_json::Value, ctx| async move {
                ctx.step(|_| async { Ok::<_, StepError>(1u32) }, None).await
            },
        )
        .await
        .unwrap();

        assert!(output.is_failed());
        assert_eq!(output.error.unwrap().error_type, "NonDeterministicExecution");
    }

    #[tokio::test]
    async fn test_replay_skips_completed_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let client = Arc::new(MockDurableServiceClient::new());

        let output = run_durable_invocation(
            input(
                vec![Operation::new("1", OperationType::Step)
                    .with_status(OperationStatus::Succeeded)
                    .with_result("42")],
                None,
            ),
            client.clone(),
            local_config(),
            move |_: serde_json::Value, ctx| async move {
                let value: u32 = ctx
                    .step(
                        move |_| async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, StepError>(0u32)
                        },
                        None,
                    )
                    .await?;
                Ok(value)
            },
        )
        .await
        .unwrap();

        assert_eq!(output.result.as_deref(), Some("42"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_event_falls_back_to_recorded_input() {
        let mut execution = Operation::new("exec-op", OperationType::Execution)
            .with_status(OperationStatus::Started);
        execution.execution_details = Some(ExecutionDetails {
            input_payload: Some("{\"orderId\":9}".to_string()),
        });

        let output = run_durable_invocation(
            input(vec![execution], None),
            Arc::new(MockDurableServiceClient::new()),
            local_config(),
            |event: serde_json::Value, _ctx| async move { Ok(event["orderId"].clone()) },
        )
        .await
        .unwrap();

        assert_eq!(output.result.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_large_result_is_checkpointed() {
        let mut execution = Operation::new("exec-op", OperationType::Execution)
            .with_status(OperationStatus::Started);
        execution.execution_details = Some(ExecutionDetails::default());
        let client = Arc::new(MockDurableServiceClient::new());

        let output = run_durable_invocation(
            input(vec![execution], None),
            client.clone(),
            local_config(),
            |_: serde_json::Value, _ctx| async move {
                Ok("z".repeat(DurableExecutionInvocationOutput::MAX_RESPONSE_SIZE + 1))
            },
        )
        .await
        .unwrap();

        assert!(output.is_succeeded());
        assert!(output.result.is_none());
        let update = client.all_updates().pop().unwrap();
        assert_eq!(update.operation_id, "exec-op");
        assert_eq!(update.operation_type, OperationType::Execution);
        assert_eq!(update.action, OperationAction::Succeed);
    }
}
