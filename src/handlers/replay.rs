//! Replay helpers shared by the operation handlers.
//!
//! Every handler starts the same way: look up the record for its id, make sure
//! the recorded type matches the requested one, then short-circuit terminal
//! records. Payload decoding and checkpoint writes also share one failure
//! policy: serialization and checkpoint failures are unrecoverable and go
//! straight to the termination signal.

use serde::{de::DeserializeOwned, Serialize};

use crate::context::{DurableContext, LogInfo, OperationIdentifier};
use crate::error::{DurableError, DurableResult, TerminationReason};
use crate::operation::{OperationType, OperationUpdate};
use crate::serdes::{JsonSerDes, SerDes, SerDesContext};
use crate::state::{CheckpointedResult, ExecutionState};

/// Fails with a non-determinism termination if the record has a different type.
pub(crate) fn ensure_operation_type(
    state: &ExecutionState,
    result: &CheckpointedResult,
    expected: OperationType,
    op_id: &OperationIdentifier,
) -> DurableResult<()> {
    match result.operation_type() {
        Some(found) if found != expected => {
            let message = format!(
                "Expected {} operation but found {} at {} (id {})",
                expected, found, op_id, op_id.operation_id
            );
            tracing::error!(operation_id = %op_id.operation_id, "{}", message);
            Err(state.terminate(TerminationReason::NonDeterministicExecution, message))
        }
        _ => Ok(()),
    }
}

/// Decodes a checkpointed payload. A missing payload decodes as JSON `null`.
pub(crate) fn decode_payload<T>(
    state: &ExecutionState,
    op_id: &OperationIdentifier,
    payload: Option<&str>,
) -> DurableResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let serdes = JsonSerDes::<T>::new();
    let serdes_ctx = SerDesContext::new(&op_id.operation_id, state.execution_id());
    serdes
        .deserialize(payload.unwrap_or("null"), &serdes_ctx)
        .map_err(|e| state.terminate(TerminationReason::SerdesFailed, e.to_string()))
}

/// Encodes a value for checkpointing.
pub(crate) fn encode_payload<T>(
    state: &ExecutionState,
    op_id: &OperationIdentifier,
    value: &T,
) -> DurableResult<String>
where
    T: Serialize + DeserializeOwned,
{
    let serdes = JsonSerDes::<T>::new();
    let serdes_ctx = SerDesContext::new(&op_id.operation_id, state.execution_id());
    serdes
        .serialize(value, &serdes_ctx)
        .map_err(|e| state.terminate(TerminationReason::SerdesFailed, e.to_string()))
}

/// The error a replayed terminal failure rethrows.
pub(crate) fn replayed_failure(result: &CheckpointedResult) -> DurableError {
    match result.error() {
        Some(error) => error.to_durable_error(),
        None => DurableError::execution(format!(
            "Operation ended as {} without an error payload",
            result
                .status()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        )),
    }
}

/// Writes a checkpoint, turning a pipeline failure into a termination.
pub(crate) async fn write_checkpoint(
    state: &ExecutionState,
    update: OperationUpdate,
    is_sync: bool,
) -> DurableResult<()> {
    match state.checkpoint(update, is_sync).await {
        Err(error) if error.is_checkpoint_failure() => {
            Err(state.terminate(TerminationReason::CheckpointFailed, error.to_string()))
        }
        other => other,
    }
}

/// Log fields for one operation.
pub(crate) fn operation_log_info(ctx: &DurableContext, op_id: &OperationIdentifier) -> LogInfo {
    let mut info = LogInfo::new(ctx.execution_id())
        .with_operation_id(&op_id.operation_id)
        .with_replay(ctx.state().is_replay());
    if let Some(ref parent_id) = op_id.parent_id {
        info = info.with_parent_id(parent_id);
    }
    info
}
