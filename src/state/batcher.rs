//! Checkpoint batching pipeline.
//!
//! One pipeline exists per invocation. Handlers enqueue updates through a
//! [`CheckpointSender`]; a single [`CheckpointBatcher`] task drains the queue.
//! Each cycle takes everything that is pending and issues exactly one backend
//! call, so at most one call is ever in flight and anything enqueued during a
//! call lands in the next one.
//!
//! ## Checkpoint tokens
//!
//! The first call uses the token from the invocation input. Every successful
//! call returns the token for the next one; the batcher swaps it in before
//! resolving the batch.
//!
//! ## Failure
//!
//! The pipeline never retries. A failed call rejects every request in the
//! batch, fires the termination signal with
//! [`TerminationReason::CheckpointFailed`], and poisons the pipeline: later
//! requests are rejected without contacting the backend because the token and
//! the durable state are no longer known.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::client::SharedDurableServiceClient;
use crate::error::{DurableError, TerminationReason};
use crate::operation::{OperationAction, OperationType, OperationUpdate};
use crate::termination::TerminationSignal;

use super::execution_state::apply_update;
use super::OperationMap;

/// Resolves a waiting caller once its batch is durable (or failed).
pub type CheckpointCompletion = oneshot::Sender<Result<(), DurableError>>;

/// Journal of flushed batches kept in record mode.
pub type CheckpointJournal = Arc<Mutex<Vec<Vec<OperationUpdate>>>>;

/// A message on the checkpoint queue.
#[derive(Debug)]
pub enum CheckpointRequest {
    /// One update; `completion` is `None` for fire-and-forget writes.
    Update {
        /// The update to write
        operation: OperationUpdate,
        /// Resolved when the batch containing the update settles
        completion: Option<CheckpointCompletion>,
    },
    /// Forces a backend call even when no updates are pending.
    Flush {
        /// Resolved when the forced call settles
        completion: CheckpointCompletion,
    },
    /// Resolves once every earlier request has settled; never forces a call.
    Barrier {
        /// Resolved after the preceding requests
        completion: CheckpointCompletion,
    },
}

impl CheckpointRequest {
    /// Creates an awaited update request and the receiver to await.
    pub fn sync(operation: OperationUpdate) -> (Self, oneshot::Receiver<Result<(), DurableError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Update {
                operation,
                completion: Some(tx),
            },
            rx,
        )
    }

    /// Creates a fire-and-forget update request.
    pub fn async_request(operation: OperationUpdate) -> Self {
        Self::Update {
            operation,
            completion: None,
        }
    }
}

#[derive(Debug, Default)]
struct FlushState {
    in_flight: bool,
    attached: Vec<CheckpointCompletion>,
    failure: Option<String>,
}

type SharedFlushState = Arc<Mutex<FlushState>>;

/// Receiving half of the checkpoint queue, consumed by [`CheckpointBatcher::new`].
pub struct CheckpointQueue {
    rx: mpsc::Receiver<CheckpointRequest>,
    flush_state: SharedFlushState,
}

/// Creates a checkpoint queue with the given capacity.
pub fn create_checkpoint_queue(capacity: usize) -> (CheckpointSender, CheckpointQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let flush_state = SharedFlushState::default();
    (
        CheckpointSender {
            tx,
            flush_state: flush_state.clone(),
        },
        CheckpointQueue { rx, flush_state },
    )
}

/// Drains the checkpoint queue, one backend call per cycle.
pub struct CheckpointBatcher {
    queue_rx: mpsc::Receiver<CheckpointRequest>,
    flush_state: SharedFlushState,
    service_client: SharedDurableServiceClient,
    execution_id: String,
    checkpoint_token: Arc<RwLock<String>>,
    operations: OperationMap,
    termination: Arc<TerminationSignal>,
    journal: Option<CheckpointJournal>,
}

impl CheckpointBatcher {
    /// Creates a batcher.
    ///
    /// Successful batches are applied to `operations` so that later lookups in
    /// the same invocation observe them.
    pub fn new(
        queue: CheckpointQueue,
        service_client: SharedDurableServiceClient,
        execution_id: impl Into<String>,
        checkpoint_token: Arc<RwLock<String>>,
        operations: OperationMap,
        termination: Arc<TerminationSignal>,
    ) -> Self {
        Self {
            queue_rx: queue.rx,
            flush_state: queue.flush_state,
            service_client,
            execution_id: execution_id.into(),
            checkpoint_token,
            operations,
            termination,
            journal: None,
        }
    }

    /// Records every flushed batch into `journal`.
    pub fn with_journal(mut self, journal: CheckpointJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Runs until every sender has been dropped.
    pub async fn run(mut self) {
        loop {
            let batch = self.collect_batch().await;
            if batch.is_empty() {
                break;
            }
            self.process_batch(batch).await;
        }
        tracing::debug!(execution_id = %self.execution_id, "Checkpoint batcher stopped");
    }

    /// Waits for one request, then takes everything else already queued.
    async fn collect_batch(&mut self) -> Vec<CheckpointRequest> {
        let mut batch = Vec::new();
        match self.queue_rx.recv().await {
            Some(request) => batch.push(request),
            None => return batch,
        }
        while let Ok(request) = self.queue_rx.try_recv() {
            batch.push(request);
        }
        batch
    }

    /// Orders a batch for the backend.
    ///
    /// Enqueue order is kept, except that an update pulls forward any later
    /// `Start` of its own id and of its ancestor contexts, outermost first.
    /// Execution completions go last.
    pub fn sort_checkpoint_batch(batch: Vec<OperationUpdate>) -> Vec<OperationUpdate> {
        if batch.len() <= 1 {
            return batch;
        }

        let (mut rest, completions): (Vec<_>, Vec<_>) = batch.into_iter().partition(|u| {
            !(u.operation_type == OperationType::Execution
                && matches!(u.action, OperationAction::Succeed | OperationAction::Fail))
        });

        let mut parents: HashMap<String, Option<String>> = HashMap::new();
        let mut start_index: HashMap<String, usize> = HashMap::new();
        for (index, update) in rest.iter().enumerate() {
            parents
                .entry(update.operation_id.clone())
                .or_insert_with(|| update.parent_id.clone());
            if update.action == OperationAction::Start {
                start_index.entry(update.operation_id.clone()).or_insert(index);
            }
        }

        let mut slots: Vec<Option<OperationUpdate>> = rest.drain(..).map(Some).collect();
        let mut ordered = Vec::with_capacity(slots.len() + completions.len());
        for index in 0..slots.len() {
            let Some(update) = slots[index].take() else {
                continue;
            };

            // Ancestors nearest first; emitted in reverse so the outermost leads.
            let mut pulls = Vec::new();
            let mut current = update.parent_id.clone();
            while let Some(parent) = current {
                if pulls.len() > parents.len() {
                    break;
                }
                if let Some(&start) = start_index.get(&parent) {
                    if start > index {
                        pulls.push(start);
                    }
                }
                current = parents.get(&parent).cloned().flatten();
            }
            pulls.reverse();
            if update.action != OperationAction::Start {
                if let Some(&start) = start_index.get(&update.operation_id) {
                    if start > index {
                        pulls.push(start);
                    }
                }
            }

            for start in pulls {
                if let Some(pulled) = slots[start].take() {
                    ordered.push(pulled);
                }
            }
            ordered.push(update);
        }
        ordered.extend(completions);
        ordered
    }

    async fn process_batch(&self, batch: Vec<CheckpointRequest>) {
        let mut updates = Vec::new();
        let mut completions = Vec::new();
        let mut barriers = Vec::new();
        let mut forced = false;
        for request in batch {
            match request {
                CheckpointRequest::Update {
                    operation,
                    completion,
                } => {
                    updates.push(operation);
                    completions.extend(completion);
                }
                CheckpointRequest::Flush { completion } => {
                    forced = true;
                    completions.push(completion);
                }
                CheckpointRequest::Barrier { completion } => barriers.push(completion),
            }
        }

        let poisoned = {
            let mut state = self.flush_state.lock().await;
            if state.failure.is_none() && (forced || !updates.is_empty()) {
                state.in_flight = true;
            }
            state.failure.clone()
        };
        if let Some(message) = poisoned {
            Self::settle(completions.into_iter().chain(barriers), &Err(message));
            return;
        }
        if updates.is_empty() && !forced {
            Self::settle(barriers, &Ok(()));
            return;
        }

        let updates = Self::sort_checkpoint_batch(updates);
        let outcome = self.send_batch(updates).await;

        let attached = {
            let mut state = self.flush_state.lock().await;
            state.in_flight = false;
            if let Err(ref message) = outcome {
                state.failure = Some(message.clone());
            }
            std::mem::take(&mut state.attached)
        };
        Self::settle(
            completions.into_iter().chain(attached).chain(barriers),
            &outcome,
        );
    }

    async fn send_batch(&self, updates: Vec<OperationUpdate>) -> Result<(), String> {
        let token = self.checkpoint_token.read().await.clone();
        let count = updates.len();
        tracing::debug!(
            execution_id = %self.execution_id,
            updates = count,
            "Flushing checkpoint batch"
        );

        match self
            .service_client
            .checkpoint(&self.execution_id, &token, updates.clone())
            .await
        {
            Ok(response) => {
                *self.checkpoint_token.write().await = response.checkpoint_token;
                {
                    let mut operations = self.operations.write().await;
                    for update in &updates {
                        apply_update(&mut operations, update);
                    }
                    if let Some(new_state) = response.new_execution_state {
                        for op in new_state.operations {
                            operations.insert(op.operation_id.clone(), op);
                        }
                    }
                }
                if let Some(ref journal) = self.journal {
                    journal.lock().await.push(updates);
                }
                Ok(())
            }
            Err(error) => {
                let message = format!("Checkpoint of {} update(s) failed: {}", count, error);
                tracing::error!(execution_id = %self.execution_id, error = %error, "Checkpoint batch failed");
                self.termination
                    .terminate(TerminationReason::CheckpointFailed, message.clone());
                Err(message)
            }
        }
    }

    fn settle(
        completions: impl IntoIterator<Item = CheckpointCompletion>,
        outcome: &Result<(), String>,
    ) {
        for completion in completions {
            let result = outcome.clone().map_err(DurableError::checkpoint);
            let _ = completion.send(result);
        }
    }
}

/// Handle for enqueueing checkpoint requests.
#[derive(Clone)]
pub struct CheckpointSender {
    tx: mpsc::Sender<CheckpointRequest>,
    flush_state: SharedFlushState,
}

impl CheckpointSender {
    async fn send(&self, request: CheckpointRequest) -> Result<(), DurableError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| DurableError::checkpoint("Checkpoint queue closed"))
    }

    async fn wait(rx: oneshot::Receiver<Result<(), DurableError>>) -> Result<(), DurableError> {
        rx.await
            .map_err(|_| DurableError::checkpoint("Checkpoint completion channel closed"))?
    }

    /// Enqueues an update and waits until its batch settles.
    pub async fn checkpoint_sync(&self, operation: OperationUpdate) -> Result<(), DurableError> {
        let (request, rx) = CheckpointRequest::sync(operation);
        self.send(request).await?;
        Self::wait(rx).await
    }

    /// Enqueues an update without waiting.
    ///
    /// A failure of the eventual batch still fires the termination signal.
    pub async fn checkpoint_async(&self, operation: OperationUpdate) -> Result<(), DurableError> {
        self.send(CheckpointRequest::async_request(operation)).await
    }

    /// Enqueues an update, waiting for it when `is_sync` is set.
    pub async fn checkpoint(&self, operation: OperationUpdate, is_sync: bool) -> Result<(), DurableError> {
        if is_sync {
            self.checkpoint_sync(operation).await
        } else {
            self.checkpoint_async(operation).await
        }
    }

    /// Makes sure a backend call happens and waits for it.
    ///
    /// Attaches to the call in flight when there is one, otherwise issues a
    /// (possibly empty) flush.
    pub async fn force(&self) -> Result<(), DurableError> {
        let attached = {
            let mut state = self.flush_state.lock().await;
            if let Some(ref message) = state.failure {
                return Err(DurableError::checkpoint(message.clone()));
            }
            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.attached.push(tx);
                Some(rx)
            } else {
                None
            }
        };
        let rx = match attached {
            Some(rx) => rx,
            None => {
                let (tx, rx) = oneshot::channel();
                self.send(CheckpointRequest::Flush { completion: tx }).await?;
                rx
            }
        };
        Self::wait(rx).await
    }

    /// Waits until every request enqueued before this call has settled.
    pub async fn drain(&self) -> Result<(), DurableError> {
        let (tx, rx) = oneshot::channel();
        self.send(CheckpointRequest::Barrier { completion: tx }).await?;
        Self::wait(rx).await
    }
}

impl std::fmt::Debug for CheckpointSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointSender").finish_non_exhaustive()
    }
}
