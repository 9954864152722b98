//! Per-invocation execution state.
//!
//! [`ExecutionState`] owns the step-data store (every recorded operation keyed
//! by wire id), the checkpoint token, the replay flag, and the sending half of
//! the checkpoint pipeline. Handlers share it through an `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::client::SharedDurableServiceClient;
use crate::config::{ExecutionConfig, ModeFlags};
use crate::error::{DurableError, TerminationReason};
use crate::invocation::InitialExecutionState;
use crate::operation::{
    ContextDetails, Operation, OperationAction, OperationStatus, OperationType, OperationUpdate,
    StepDetails,
};
use crate::termination::TerminationSignal;

use super::batcher::{create_checkpoint_queue, CheckpointBatcher, CheckpointJournal, CheckpointSender};
use super::checkpoint_result::CheckpointedResult;
use super::replay_status::ReplayStatus;
use super::OperationMap;

/// Manages the state of one durable execution for the current invocation.
pub struct ExecutionState {
    execution_id: String,
    checkpoint_token: Arc<RwLock<String>>,
    operations: OperationMap,
    service_client: SharedDurableServiceClient,
    termination: Arc<TerminationSignal>,
    replay_status: AtomicU8,
    replayed_operations: RwLock<HashSet<String>>,
    next_marker: RwLock<Option<String>>,
    parent_done_lock: Mutex<HashSet<String>>,
    checkpoint_sender: CheckpointSender,
    journal: Option<CheckpointJournal>,
    execution_operation: Option<Operation>,
    config: ExecutionConfig,
}

impl ExecutionState {
    /// Builds the state and the checkpoint batcher that serves it.
    ///
    /// The caller must spawn [`CheckpointBatcher::run`]; checkpoints enqueued
    /// before that simply wait in the queue.
    pub fn with_pipeline(
        execution_id: impl Into<String>,
        checkpoint_token: impl Into<String>,
        initial_state: InitialExecutionState,
        service_client: SharedDurableServiceClient,
        termination: Arc<TerminationSignal>,
        config: ExecutionConfig,
    ) -> (Self, CheckpointBatcher) {
        let execution_id = execution_id.into();
        let checkpoint_token = Arc::new(RwLock::new(checkpoint_token.into()));

        let execution_operation = initial_state
            .operations
            .iter()
            .find(|op| op.operation_type == OperationType::Execution)
            .cloned();
        let has_recorded_work = initial_state
            .operations
            .iter()
            .any(|op| op.operation_type != OperationType::Execution);
        let replay_status = if has_recorded_work || initial_state.next_marker.is_some() {
            ReplayStatus::Replay
        } else {
            ReplayStatus::New
        };

        let operations: OperationMap = Arc::new(RwLock::new(
            initial_state
                .operations
                .into_iter()
                .map(|op| (op.operation_id.clone(), op))
                .collect(),
        ));

        let (checkpoint_sender, queue) = create_checkpoint_queue(config.checkpoint_queue_capacity);
        let journal = config.mode.record.then(CheckpointJournal::default);
        let mut batcher = CheckpointBatcher::new(
            queue,
            service_client.clone(),
            execution_id.clone(),
            checkpoint_token.clone(),
            operations.clone(),
            termination.clone(),
        );
        if let Some(ref journal) = journal {
            batcher = batcher.with_journal(journal.clone());
        }

        let state = Self {
            execution_id,
            checkpoint_token,
            operations,
            service_client,
            termination,
            replay_status: AtomicU8::new(replay_status as u8),
            replayed_operations: RwLock::new(HashSet::new()),
            next_marker: RwLock::new(initial_state.next_marker),
            parent_done_lock: Mutex::new(HashSet::new()),
            checkpoint_sender,
            journal,
            execution_operation,
            config,
        };
        (state, batcher)
    }

    /// Returns the execution id.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Returns the token the next checkpoint call will use.
    pub async fn checkpoint_token(&self) -> String {
        self.checkpoint_token.read().await.clone()
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Returns the mode flags.
    pub fn mode(&self) -> ModeFlags {
        self.config.mode
    }

    /// Returns the termination signal.
    pub fn termination(&self) -> &Arc<TerminationSignal> {
        &self.termination
    }

    /// Fires the termination signal and returns the suspension to propagate.
    pub fn terminate(&self, reason: TerminationReason, message: impl Into<String>) -> DurableError {
        self.termination.suspend(reason, message)
    }

    /// Returns the current replay status.
    pub fn replay_status(&self) -> ReplayStatus {
        ReplayStatus::from(self.replay_status.load(Ordering::SeqCst))
    }

    /// Returns true while recorded operations remain unvisited.
    pub fn is_replay(&self) -> bool {
        self.replay_status().is_replay()
    }

    /// Returns the `Execution` operation from the initial state.
    pub fn execution_operation(&self) -> Option<&Operation> {
        self.execution_operation.as_ref()
    }

    /// Returns the user input recorded on the `Execution` operation.
    pub fn original_input_raw(&self) -> Option<&str> {
        self.execution_operation
            .as_ref()
            .and_then(|op| op.execution_details.as_ref())
            .and_then(|d| d.input_payload.as_deref())
    }

    /// Looks up the record for an operation id.
    pub async fn get_checkpoint_result(&self, operation_id: &str) -> CheckpointedResult {
        let operations = self.operations.read().await;
        CheckpointedResult::new(operations.get(operation_id).cloned())
    }

    /// Marks a recorded operation as visited.
    ///
    /// Once every recorded operation has been visited and no pages remain,
    /// the state switches from replay to new execution.
    pub async fn track_replay(&self, operation_id: &str) {
        if !self.is_replay() {
            return;
        }
        let replayed_count = {
            let mut replayed = self.replayed_operations.write().await;
            replayed.insert(operation_id.to_string());
            replayed.len()
        };
        let total_count = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| op.operation_type != OperationType::Execution)
            .count();

        if replayed_count >= total_count && self.next_marker.read().await.is_none() {
            tracing::debug!(execution_id = %self.execution_id, "Replay complete");
            self.replay_status.store(ReplayStatus::New as u8, Ordering::SeqCst);
        }
    }

    /// Fetches the next page of recorded operations. Returns false when none remain.
    pub async fn load_more_operations(&self) -> Result<bool, DurableError> {
        let marker = match self.next_marker.read().await.clone() {
            Some(marker) => marker,
            None => return Ok(false),
        };

        let response = self
            .service_client
            .get_operations(&self.execution_id, &marker)
            .await?;
        tracing::debug!(
            execution_id = %self.execution_id,
            loaded = response.operations.len(),
            "Loaded page of recorded operations"
        );

        {
            let mut operations = self.operations.write().await;
            for op in response.operations {
                operations.insert(op.operation_id.clone(), op);
            }
        }
        *self.next_marker.write().await = response.next_marker;
        Ok(true)
    }

    /// Fetches every remaining page.
    pub async fn load_all_operations(&self) -> Result<(), DurableError> {
        while self.load_more_operations().await? {}
        Ok(())
    }

    /// Returns the number of recorded operations held locally.
    pub async fn operation_count(&self) -> usize {
        self.operations.read().await.len()
    }

    /// Marks a context as finished; descendants may no longer checkpoint.
    pub async fn mark_parent_done(&self, parent_id: &str) {
        self.parent_done_lock.lock().await.insert(parent_id.to_string());
    }

    /// Returns true if the context has been marked finished.
    pub async fn is_parent_done(&self, parent_id: &str) -> bool {
        self.parent_done_lock.lock().await.contains(parent_id)
    }

    /// Enqueues a checkpoint update, waiting for durability when `is_sync` is set.
    pub async fn checkpoint(&self, update: OperationUpdate, is_sync: bool) -> Result<(), DurableError> {
        if let Some(ref parent_id) = update.parent_id {
            if self.is_parent_done(parent_id).await {
                return Err(DurableError::OrphanedChild {
                    message: format!(
                        "Cannot checkpoint operation {}: parent {} has completed",
                        update.operation_id, parent_id
                    ),
                    operation_id: update.operation_id.clone(),
                });
            }
        }
        self.checkpoint_sender.checkpoint(update, is_sync).await
    }

    /// Enqueues an update and waits until it is durable.
    pub async fn checkpoint_sync(&self, update: OperationUpdate) -> Result<(), DurableError> {
        self.checkpoint(update, true).await
    }

    /// Enqueues an update without waiting.
    pub async fn checkpoint_async(&self, update: OperationUpdate) -> Result<(), DurableError> {
        self.checkpoint(update, false).await
    }

    /// Makes sure a checkpoint call happens and waits for it.
    pub async fn force(&self) -> Result<(), DurableError> {
        self.checkpoint_sender.force().await
    }

    /// Waits until everything enqueued so far has settled.
    pub async fn drain(&self) -> Result<(), DurableError> {
        self.checkpoint_sender.drain().await
    }

    /// Returns the flushed batches, in order. Empty unless record mode is on.
    pub async fn recorded_batches(&self) -> Vec<Vec<OperationUpdate>> {
        match self.journal {
            Some(ref journal) => journal.lock().await.clone(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("execution_id", &self.execution_id)
            .field("replay_status", &self.replay_status())
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

/// Applies a durable update to the local record store.
///
/// A `Start` for an existing record only resets its status so that the
/// backend-recorded attempt count survives.
pub(super) fn apply_update(operations: &mut HashMap<String, Operation>, update: &OperationUpdate) {
    let op = operations
        .entry(update.operation_id.clone())
        .or_insert_with(|| {
            let mut op = Operation::new(&update.operation_id, update.operation_type);
            op.sub_type = update.sub_type;
            op.parent_id = update.parent_id.clone();
            op.name = update.name.clone();
            op
        });

    match update.action {
        OperationAction::Start => {
            op.status = OperationStatus::Started;
        }
        OperationAction::Succeed => {
            op.status = OperationStatus::Succeeded;
            op.result = update.payload.clone();
            if update.context_options.map(|o| o.replay_children).unwrap_or(false) {
                op.context_details = Some(ContextDetails {
                    replay_children: Some(true),
                });
            }
        }
        OperationAction::Fail => {
            op.status = OperationStatus::Failed;
            op.error = update.error.clone();
        }
        OperationAction::Retry => {
            op.status = OperationStatus::Pending;
            op.error = update.error.clone();
            let attempt = op.attempt() + 1;
            op.step_details.get_or_insert_with(StepDetails::default).attempt = Some(attempt);
        }
    }
}
