//! Callback handlers.
//!
//! A callback is an operation completed from outside the workflow. Creating
//! one records a `Start` and reads back the callback id the backend assigned;
//! external systems complete the callback through the backend using that id.
//! [`Callback::result`] suspends the invocation until the backend reports a
//! terminal status for it.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::config::{CallbackConfig, ChildConfig};
use crate::context::{DurableContext, LogInfo, Logger, OperationIdentifier};
use crate::error::{DurableError, DurableResult, StepError, TerminationReason};
use crate::operation::{
    CallbackOptions, OperationStatus, OperationSubType, OperationType, OperationUpdate,
};
use crate::state::{ExecutionState, RecordState};

use super::child::child_handler;
use super::replay::{decode_payload, ensure_operation_type, operation_log_info, write_checkpoint};
use super::step::{step_handler, StepContext};

/// Handle to a created callback.
pub struct Callback<T> {
    callback_id: String,
    op_id: OperationIdentifier,
    state: Arc<ExecutionState>,
    logger: Arc<dyn Logger>,
    log_info: LogInfo,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("callback_id", &self.callback_id)
            .field("operation_id", &self.op_id.operation_id)
            .finish_non_exhaustive()
    }
}

impl<T> Callback<T>
where
    T: Serialize + DeserializeOwned,
{
    /// The id external systems use to complete this callback.
    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    /// Wire id of the callback operation.
    pub fn operation_id(&self) -> &str {
        &self.op_id.operation_id
    }

    /// Returns the value the callback was completed with.
    ///
    /// Suspends with [`TerminationReason::CallbackPending`] while the callback
    /// has not completed. A failed or timed-out callback returns
    /// [`DurableError::Callback`].
    pub async fn result(&self) -> DurableResult<T> {
        let recorded = self.state.get_checkpoint_result(&self.op_id.operation_id).await;
        match recorded.state() {
            RecordState::Succeeded => {
                self.logger.debug(
                    &format!("Callback {} completed", self.callback_id),
                    &self.log_info,
                );
                decode_payload(&self.state, &self.op_id, recorded.result())
            }
            RecordState::Failed => {
                let message = match (recorded.status(), recorded.error()) {
                    (Some(OperationStatus::TimedOut), _) => "Callback timed out".to_string(),
                    (_, Some(error)) => error.error_message.clone(),
                    _ => "Callback failed".to_string(),
                };
                Err(DurableError::Callback {
                    message,
                    callback_id: Some(self.callback_id.clone()),
                })
            }
            _ => {
                self.logger.debug(
                    &format!("Callback {} pending, suspending", self.callback_id),
                    &self.log_info,
                );
                Err(self.state.terminate(
                    TerminationReason::CallbackPending,
                    format!("Callback {} has not completed", self.callback_id),
                ))
            }
        }
    }
}

/// Creates a callback, or picks up the one recorded for this id.
pub async fn callback_handler<T>(
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
    config: &CallbackConfig,
) -> DurableResult<Callback<T>>
where
    T: Serialize + DeserializeOwned,
{
    let state = ctx.state();
    let log_info = operation_log_info(ctx, op_id);

    let mut recorded = state.get_checkpoint_result(&op_id.operation_id).await;
    ensure_operation_type(state, &recorded, OperationType::Callback, op_id)?;
    if recorded.is_existent() {
        state.track_replay(&op_id.operation_id).await;
    } else {
        ctx.handler_logger()
            .debug(&format!("Creating callback {}", op_id), &log_info);
        let start = op_id
            .apply_to(OperationUpdate::start(&op_id.operation_id, OperationType::Callback))
            .with_sub_type(OperationSubType::Callback)
            .with_callback_options(CallbackOptions {
                timeout_seconds: config.timeout.to_seconds(),
                heartbeat_timeout_seconds: config.heartbeat_timeout.to_seconds(),
            });
        write_checkpoint(state, start, true).await?;
        recorded = state.get_checkpoint_result(&op_id.operation_id).await;
    }

    let callback_id = recorded
        .callback_id()
        .map(str::to_string)
        .ok_or_else(|| DurableError::Callback {
            message: format!("No callback id recorded for {}", op_id),
            callback_id: None,
        })?;

    Ok(Callback {
        callback_id,
        op_id: op_id.clone(),
        state: state.clone(),
        logger: ctx.handler_logger().clone(),
        log_info,
        _marker: PhantomData,
    })
}

/// Creates a callback, hands its id to `submitter` in a step, then waits for the result.
///
/// Everything runs in one child context, so a completed wait replays as a
/// single recorded value.
pub async fn wait_for_callback_handler<T, F, Fut>(
    submitter: F,
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
    config: CallbackConfig,
) -> DurableResult<T>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(String, StepContext) -> Fut + Send,
    Fut: Future<Output = Result<(), StepError>> + Send,
{
    child_handler(
        move |child: DurableContext| async move {
            let callback_op = child.next_operation_identifier(None);
            let callback: Callback<T> = callback_handler(&child, &callback_op, &config).await?;

            let callback_id = callback.callback_id().to_string();
            let submit_op = child.next_operation_identifier(None);
            step_handler(
                move |step_ctx| submitter(callback_id, step_ctx),
                &child,
                &submit_op,
                OperationSubType::CallbackSubmitter,
                &config.submitter,
            )
            .await?;

            callback.result().await
        },
        ctx,
        op_id,
        OperationSubType::WaitForCallback,
        &ChildConfig::default(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::client::MockDurableServiceClient;
    use crate::duration::Duration;
    use crate::error::ErrorObject;
    use crate::operation::{CallbackDetails, Operation, OperationAction};
    use crate::test_support::harness;

    fn recorded_callback(id: &str, status: OperationStatus) -> Operation {
        let mut op = Operation::new(id, OperationType::Callback).with_status(status);
        op.callback_details = Some(CallbackDetails {
            callback_id: Some(format!("external-{}", id)),
        });
        op
    }

    #[tokio::test]
    async fn test_create_callback_reads_assigned_id() {
        let h = harness(MockDurableServiceClient::new().with_callback_ids(), vec![]);
        let config = CallbackConfig {
            timeout: Duration::from_minutes(5),
            heartbeat_timeout: Duration::from_seconds(60),
            ..Default::default()
        };

        let callback: Callback<String> = h.ctx.create_callback(Some(config)).await.unwrap();

        assert_eq!(callback.callback_id(), "cb-1");
        let start = h.client.all_updates().pop().unwrap();
        assert_eq!(start.action, OperationAction::Start);
        let options = start.callback_options.unwrap();
        assert_eq!(options.timeout_seconds, 300);
        assert_eq!(options.heartbeat_timeout_seconds, 60);
    }

    #[tokio::test]
    async fn test_pending_callback_suspends() {
        let h = harness(MockDurableServiceClient::new().with_callback_ids(), vec![]);

        let callback: Callback<String> = h.ctx.create_callback(None).await.unwrap();
        let error = callback.result().await.unwrap_err();

        assert!(error.is_suspended());
        assert_eq!(
            h.termination.details().map(|d| d.reason),
            Some(TerminationReason::CallbackPending)
        );
    }

    #[tokio::test]
    async fn test_completed_callback_returns_value() {
        let h = harness(
            MockDurableServiceClient::new(),
            vec![recorded_callback("1", OperationStatus::Succeeded).with_result("{\"approved\":true}")],
        );

        let callback: Callback<serde_json::Value> = h.ctx.create_callback(None).await.unwrap();
        let value = callback.result().await.unwrap();

        assert_eq!(callback.callback_id(), "external-1");
        assert_eq!(value["approved"], true);
        assert!(h.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_callback_returns_callback_error() {
        let h = harness(
            MockDurableServiceClient::new(),
            vec![recorded_callback("1", OperationStatus::Failed)
                .with_error(ErrorObject::new("Rejected", "reviewer declined"))],
        );

        let callback: Callback<String> = h.ctx.create_callback(None).await.unwrap();
        let error = callback.result().await.unwrap_err();

        match error {
            DurableError::Callback { message, callback_id } => {
                assert_eq!(message, "reviewer declined");
                assert_eq!(callback_id.as_deref(), Some("external-1"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timed_out_callback_returns_callback_error() {
        let h = harness(
            MockDurableServiceClient::new(),
            vec![recorded_callback("1", OperationStatus::TimedOut)],
        );

        let callback: Callback<String> = h.ctx.create_callback(None).await.unwrap();
        let error = callback.result().await.unwrap_err();

        assert!(matches!(error, DurableError::Callback { ref message, .. } if message == "Callback timed out"));
    }

    #[tokio::test]
    async fn test_missing_callback_id_is_an_error() {
        let h = harness(MockDurableServiceClient::new(), vec![]);

        let error = h.ctx.create_callback::<String>(None).await.unwrap_err();

        assert!(matches!(error, DurableError::Callback { callback_id: None, .. }));
    }

    #[tokio::test]
    async fn test_wait_for_callback_submits_then_suspends() {
        let h = harness(MockDurableServiceClient::new().with_callback_ids(), vec![]);
        let submitted = Arc::new(Mutex::new(None));
        let sink = submitted.clone();

        let error = h
            .ctx
            .wait_for_callback::<String, _, _>(
                move |callback_id, _| async move {
                    *sink.lock().unwrap() = Some(callback_id);
                    Ok(())
                },
                None,
            )
            .await
            .unwrap_err();

        assert!(error.is_suspended());
        assert_eq!(submitted.lock().unwrap().as_deref(), Some("cb-1-1"));

        let updates = h.client.all_updates();
        let context_start = updates.iter().find(|u| u.operation_id == "1").unwrap();
        assert_eq!(context_start.sub_type, Some(OperationSubType::WaitForCallback));
        let submitter = updates
            .iter()
            .find(|u| u.operation_id == "1-2" && u.action == OperationAction::Succeed)
            .unwrap();
        assert_eq!(submitter.sub_type, Some(OperationSubType::CallbackSubmitter));
        assert_eq!(submitter.parent_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_wait_for_callback_replays_without_submitting() {
        let h = harness(
            MockDurableServiceClient::new(),
            vec![
                Operation::new("1", OperationType::Context).with_status(OperationStatus::Started),
                recorded_callback("1-1", OperationStatus::Succeeded)
                    .with_result("\"approved\"")
                    .with_parent_id("1"),
                Operation::new("1-2", OperationType::Step)
                    .with_status(OperationStatus::Succeeded)
                    .with_result("null")
                    .with_parent_id("1"),
            ],
        );

        let value: String = h
            .ctx
            .wait_for_callback(
                |_, _| async { Err::<(), StepError>("submitter must not run again".into()) },
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, "approved");
        let succeed = h.client.all_updates().pop().unwrap();
        assert_eq!(succeed.operation_id, "1");
        assert_eq!(succeed.action, OperationAction::Succeed);
    }
}
