//! Wait handler.
//!
//! A wait is a durable timer. The first invocation records a `Start` with the
//! wait duration and suspends; the backend re-invokes the execution once the
//! timer fires and the replay finds the wait `Succeeded`.

use crate::context::{DurableContext, OperationIdentifier};
use crate::duration::Duration;
use crate::error::{DurableResult, TerminationReason};
use crate::operation::{OperationSubType, OperationType, OperationUpdate};
use crate::state::RecordState;

use super::replay::{ensure_operation_type, operation_log_info, replayed_failure, write_checkpoint};

/// Suspends until `duration` has elapsed.
pub async fn wait_handler(
    duration: Duration,
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
) -> DurableResult<()> {
    duration.validate_for_wait()?;

    let state = ctx.state();
    let logger = ctx.handler_logger();
    let log_info = operation_log_info(ctx, op_id);

    let recorded = state.get_checkpoint_result(&op_id.operation_id).await;
    ensure_operation_type(state, &recorded, OperationType::Wait, op_id)?;
    if recorded.is_existent() {
        state.track_replay(&op_id.operation_id).await;
    }

    match recorded.state() {
        RecordState::Succeeded => {
            logger.debug(&format!("Wait {} already elapsed", op_id), &log_info);
            return Ok(());
        }
        RecordState::Failed => return Err(replayed_failure(&recorded)),
        RecordState::Absent => {
            logger.debug(
                &format!("Starting wait {} for {}s", op_id, duration.to_seconds()),
                &log_info,
            );
            let start = op_id
                .apply_to(OperationUpdate::start(&op_id.operation_id, OperationType::Wait))
                .with_sub_type(OperationSubType::Wait)
                .with_wait_seconds(duration.to_seconds());
            write_checkpoint(state, start, true).await?;
        }
        _ => {}
    }

    Err(state.terminate(
        TerminationReason::WaitScheduled,
        format!("Wait {} scheduled for {}s", op_id, duration.to_seconds()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockDurableServiceClient;
    use crate::error::DurableError;
    use crate::operation::{Operation, OperationAction, OperationStatus};
    use crate::test_support::harness;

    #[tokio::test]
    async fn test_first_wait_checkpoints_start_and_suspends() {
        let h = harness(MockDurableServiceClient::new(), vec![]);

        let error = h.ctx.wait_named("cool-off", Duration::from_minutes(5)).await.unwrap_err();

        assert!(error.is_suspended());
        assert_eq!(
            h.termination.details().map(|d| d.reason),
            Some(TerminationReason::WaitScheduled)
        );
        let updates = h.client.all_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].action, OperationAction::Start);
        assert_eq!(updates[0].name.as_deref(), Some("cool-off"));
        assert_eq!(updates[0].wait_options.as_ref().map(|o| o.wait_seconds), Some(300));
    }

    #[tokio::test]
    async fn test_elapsed_wait_returns_immediately() {
        let h = harness(
            MockDurableServiceClient::new(),
            vec![Operation::new("1", OperationType::Wait).with_status(OperationStatus::Succeeded)],
        );

        h.ctx.wait(Duration::from_seconds(10)).await.unwrap();

        assert!(!h.termination.is_terminated());
        assert!(h.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pending_wait_suspends_without_checkpoint() {
        let h = harness(
            MockDurableServiceClient::new(),
            vec![Operation::new("1", OperationType::Wait).with_status(OperationStatus::Started)],
        );

        let error = h.ctx.wait(Duration::from_seconds(10)).await.unwrap_err();

        assert!(error.is_suspended());
        assert!(h.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_zero_wait_is_rejected() {
        let h = harness(MockDurableServiceClient::new(), vec![]);

        let error = h.ctx.wait(Duration::ZERO).await.unwrap_err();

        assert!(matches!(error, DurableError::Validation { .. }));
        assert!(!h.termination.is_terminated());
    }
}
