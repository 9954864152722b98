//! Child context handler.
//!
//! A child context runs a closure in a nested scope and records the closure's
//! result as one `Context` operation. Operations inside the scope carry the
//! context's wire id as their parent and take ids prefixed with its logical id.
//!
//! Results above the large-payload threshold are not stored. The context is
//! recorded as succeeded with an empty payload and the replay-children flag,
//! and a replay rebuilds the value by running the closure again, which in
//! turn replays the children from their own records.

use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};

use crate::config::ChildConfig;
use crate::context::{DurableContext, OperationIdentifier};
use crate::error::{DurableResult, ErrorObject};
use crate::operation::{OperationSubType, OperationType, OperationUpdate};
use crate::state::RecordState;

use super::replay::{
    decode_payload, encode_payload, ensure_operation_type, operation_log_info, replayed_failure,
    write_checkpoint,
};

/// Runs `func` in a child context of `parent`.
pub async fn child_handler<T, F, Fut>(
    func: F,
    parent: &DurableContext,
    op_id: &OperationIdentifier,
    sub_type: OperationSubType,
    config: &ChildConfig,
) -> DurableResult<T>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(DurableContext) -> Fut + Send,
    Fut: Future<Output = DurableResult<T>> + Send,
{
    let state = parent.state();
    let logger = parent.handler_logger();
    let log_info = operation_log_info(parent, op_id);
    logger.debug(&format!("Starting child context: {}", op_id), &log_info);

    let recorded = state.get_checkpoint_result(&op_id.operation_id).await;
    ensure_operation_type(state, &recorded, OperationType::Context, op_id)?;
    if recorded.is_existent() {
        state.track_replay(&op_id.operation_id).await;
    }

    let mut rebuilding = false;
    match recorded.state() {
        RecordState::Succeeded if recorded.replays_children() => {
            logger.debug(&format!("Rebuilding large result of {}", op_id), &log_info);
            rebuilding = true;
        }
        RecordState::Succeeded => {
            logger.debug(&format!("Replaying succeeded child context: {}", op_id), &log_info);
            return decode_payload(state, op_id, recorded.result());
        }
        RecordState::Failed => {
            logger.debug(&format!("Replaying failed child context: {}", op_id), &log_info);
            return Err(replayed_failure(&recorded));
        }
        RecordState::Absent => {
            let start = op_id
                .apply_to(OperationUpdate::start(&op_id.operation_id, OperationType::Context))
                .with_sub_type(sub_type);
            write_checkpoint(state, start, false).await?;
        }
        RecordState::Started | RecordState::Pending | RecordState::Ready => {}
    }

    let child_ctx = parent.create_child_context(op_id);
    match func(child_ctx).await {
        Ok(value) => {
            let payload = encode_payload(state, op_id, &value)?;
            if rebuilding {
                return decode_payload(state, op_id, Some(&payload));
            }

            let threshold = config
                .large_payload_threshold_bytes
                .unwrap_or(state.config().large_payload_threshold_bytes);
            let succeed = if payload.len() > threshold {
                logger.debug(
                    &format!(
                        "Result of {} is {} bytes, recording for replay instead",
                        op_id,
                        payload.len()
                    ),
                    &log_info,
                );
                OperationUpdate::succeed(&op_id.operation_id, OperationType::Context, Some(String::new()))
                    .with_replay_children()
            } else {
                OperationUpdate::succeed(&op_id.operation_id, OperationType::Context, Some(payload.clone()))
            };
            write_checkpoint(state, op_id.apply_to(succeed).with_sub_type(sub_type), true).await?;
            state.mark_parent_done(&op_id.operation_id).await;
            decode_payload(state, op_id, Some(&payload))
        }
        Err(error) if error.is_suspended() => Err(error),
        Err(error) => {
            if let Some(reason) = error.unrecoverable_reason() {
                return Err(state.terminate(reason, error.to_string()));
            }
            if rebuilding {
                return Err(error);
            }
            let error_object = ErrorObject::from(&error);
            let fail = op_id
                .apply_to(OperationUpdate::fail(
                    &op_id.operation_id,
                    OperationType::Context,
                    error_object.clone(),
                ))
                .with_sub_type(sub_type);
            write_checkpoint(state, fail, true).await?;
            state.mark_parent_done(&op_id.operation_id).await;
            Err(error_object.to_durable_error())
        }
    }
}
