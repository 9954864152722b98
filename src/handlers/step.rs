//! Step operation handler.
//!
//! A step is a leaf unit of work. Its record moves from absent to `Started`
//! to `Succeeded` or `Failed`; a failed attempt that will be retried is
//! recorded as `Pending` (delay not elapsed) and then `Ready`.
//!
//! On replay a terminal record short-circuits: the stored payload is returned
//! or the stored error rethrown, and user code is not called again.

use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};

use crate::config::{StepConfig, StepSemantics};
use crate::context::{DurableContext, OperationIdentifier};
use crate::error::{DurableError, DurableResult, ErrorObject, StepError, TerminationReason};
use crate::operation::{OperationSubType, OperationType, OperationUpdate};
use crate::serdes::SerDesContext;
use crate::state::RecordState;

use super::replay::{
    decode_payload, encode_payload, ensure_operation_type, operation_log_info, replayed_failure,
    write_checkpoint,
};

/// Information passed to a step function.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Wire id of the step
    pub operation_id: String,
    /// Logical id of the step
    pub logical_id: String,
    /// Wire id of the enclosing context, if any
    pub parent_id: Option<String>,
    /// The step name, if provided
    pub name: Option<String>,
    /// The execution id
    pub execution_id: String,
    /// The current attempt, starting at 1
    pub attempt: u32,
}

impl StepContext {
    fn new(op_id: &OperationIdentifier, execution_id: &str, attempt: u32) -> Self {
        Self {
            operation_id: op_id.operation_id.clone(),
            logical_id: op_id.logical_id.clone(),
            parent_id: op_id.parent_id.clone(),
            name: op_id.name.clone(),
            execution_id: execution_id.to_string(),
            attempt,
        }
    }

    /// SerDes context for values produced by this step.
    pub fn serdes_context(&self) -> SerDesContext {
        SerDesContext::new(&self.operation_id, &self.execution_id)
    }
}

/// Runs a step with replay, checkpointing and retries.
///
/// `AtMostOncePerRetry` awaits the `Start` checkpoint before calling `func`, so
/// an attempt interrupted mid-flight is detected on replay and handed to the
/// retry policy. `AtLeastOncePerRetry` only enqueues `Start`; an interrupted
/// attempt simply runs again.
pub async fn step_handler<T, F, Fut>(
    func: F,
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
    sub_type: OperationSubType,
    config: &StepConfig,
) -> DurableResult<T>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(StepContext) -> Fut + Send,
    Fut: Future<Output = Result<T, StepError>> + Send,
{
    let state = ctx.state();
    let logger = ctx.handler_logger();
    let log_info = operation_log_info(ctx, op_id);
    logger.debug(&format!("Starting step: {}", op_id), &log_info);

    let recorded = state.get_checkpoint_result(&op_id.operation_id).await;
    ensure_operation_type(state, &recorded, OperationType::Step, op_id)?;
    if recorded.is_existent() {
        state.track_replay(&op_id.operation_id).await;
    }

    let attempt = recorded.attempt() + 1;
    let send_start = match recorded.state() {
        RecordState::Succeeded => {
            logger.debug(&format!("Replaying succeeded step: {}", op_id), &log_info);
            return decode_payload(state, op_id, recorded.result());
        }
        RecordState::Failed => {
            logger.debug(&format!("Replaying failed step: {}", op_id), &log_info);
            return Err(replayed_failure(&recorded));
        }
        RecordState::Pending => {
            return Err(state.terminate(
                TerminationReason::RetryScheduled,
                format!("Retry of step {} is not due yet", op_id),
            ));
        }
        RecordState::Started => match config.step_semantics {
            StepSemantics::AtMostOncePerRetry => {
                logger.warn(&format!("Step {} was interrupted", op_id), &log_info);
                let error = DurableError::StepInterrupted {
                    operation_id: op_id.operation_id.clone(),
                    attempt,
                };
                return handle_failure(error, attempt, ctx, op_id, sub_type, config).await;
            }
            StepSemantics::AtLeastOncePerRetry => false,
        },
        RecordState::Ready | RecordState::Absent => true,
    };

    if send_start {
        let start = op_id
            .apply_to(OperationUpdate::start(&op_id.operation_id, OperationType::Step))
            .with_sub_type(sub_type);
        let is_sync = config.step_semantics == StepSemantics::AtMostOncePerRetry;
        write_checkpoint(state, start, is_sync).await?;
    }

    let step_ctx = StepContext::new(op_id, state.execution_id(), attempt);
    match func(step_ctx).await {
        Ok(value) => {
            let payload = encode_payload(state, op_id, &value)?;
            let succeed = op_id
                .apply_to(OperationUpdate::succeed(
                    &op_id.operation_id,
                    OperationType::Step,
                    Some(payload.clone()),
                ))
                .with_sub_type(sub_type);
            write_checkpoint(state, succeed, true).await?;
            logger.debug(&format!("Step succeeded: {}", op_id), &log_info);
            decode_payload(state, op_id, Some(&payload))
        }
        Err(error) => {
            let error = DurableError::from_step_error(error);
            handle_failure(error, attempt, ctx, op_id, sub_type, config).await
        }
    }
}

async fn handle_failure<T>(
    error: DurableError,
    attempt: u32,
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
    sub_type: OperationSubType,
    config: &StepConfig,
) -> DurableResult<T> {
    let state = ctx.state();
    if error.is_suspended() {
        return Err(error);
    }
    if let Some(reason) = error.unrecoverable_reason() {
        ctx.handler_logger().error(
            &format!("Step {} failed unrecoverably: {}", op_id, error),
            &operation_log_info(ctx, op_id),
        );
        return Err(state.terminate(reason, error.to_string()));
    }

    let error_object = ErrorObject::from(&error);
    let decision = config.effective_retry_strategy().decide(&error, attempt);
    if decision.should_retry {
        let delay_seconds = decision.delay_seconds.unwrap_or(0);
        tracing::debug!(
            operation_id = %op_id.operation_id,
            attempt,
            delay_seconds,
            "Scheduling step retry"
        );
        let retry = op_id
            .apply_to(OperationUpdate::retry(
                &op_id.operation_id,
                error_object,
                delay_seconds,
            ))
            .with_sub_type(sub_type);
        write_checkpoint(state, retry, true).await?;
        return Err(state.terminate(
            TerminationReason::RetryScheduled,
            format!(
                "Step {} attempt {} failed, retrying in {}s",
                op_id, attempt, delay_seconds
            ),
        ));
    }

    let fail = op_id
        .apply_to(OperationUpdate::fail(
            &op_id.operation_id,
            OperationType::Step,
            error_object.clone(),
        ))
        .with_sub_type(sub_type);
    write_checkpoint(state, fail, true).await?;
    Err(error_object.to_durable_error())
}
