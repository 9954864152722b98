//! Bounded fan-out for map, parallel and concurrent execution.
//!
//! Items run as interleaved futures on the caller's task. At most
//! `max_concurrency` of them are in flight at once; the next item is launched
//! as soon as one finishes. Each item gets its own child context, so its id
//! is allocated when it is launched and launch order is always index order.
//!
//! Every item runs to completion regardless of sibling failures. Results are
//! reported by original index, and the failure with the lowest index wins
//! when the batch is collapsed into a single result.

use std::future::Future;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::{ChildConfig, ConcurrencyConfig};
use crate::context::{DurableContext, OperationIdentifier};
use crate::error::{DurableError, DurableResult, ErrorObject};
use crate::handlers::child_handler;
use crate::operation::OperationSubType;

/// Status of an individual item in a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchItemStatus {
    /// Item completed successfully
    Succeeded,
    /// Item failed with an error
    Failed,
}

impl BatchItemStatus {
    /// Returns true if this status represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if this status represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for BatchItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of one item, keyed by its original position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem<T> {
    /// Index of this item in the original collection
    pub index: usize,
    /// Status of this item
    pub status: BatchItemStatus,
    /// Result value if succeeded
    pub result: Option<T>,
    /// Error details if failed
    pub error: Option<ErrorObject>,
}

impl<T> BatchItem<T> {
    /// Creates a succeeded item.
    pub fn succeeded(index: usize, result: T) -> Self {
        Self {
            index,
            status: BatchItemStatus::Succeeded,
            result: Some(result),
            error: None,
        }
    }

    /// Creates a failed item.
    pub fn failed(index: usize, error: ErrorObject) -> Self {
        Self {
            index,
            status: BatchItemStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    /// Returns true if this item succeeded.
    pub fn is_succeeded(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if this item failed.
    pub fn is_failed(&self) -> bool {
        self.status.is_failure()
    }
}

/// Per-item outcomes of a batch, in index order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult<T> {
    /// Results for each item in the batch
    pub items: Vec<BatchItem<T>>,
}

impl<T> BatchResult<T> {
    /// Creates a batch result from items in index order.
    pub fn new(items: Vec<BatchItem<T>>) -> Self {
        Self { items }
    }

    /// Builds a batch from raw per-item results.
    ///
    /// A suspended item suspends the whole batch; the lowest-index suspension
    /// is returned.
    pub fn from_results(results: Vec<DurableResult<T>>) -> DurableResult<Self> {
        let mut items = Vec::with_capacity(results.len());
        let mut suspension = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => items.push(BatchItem::succeeded(index, value)),
                Err(error) if error.is_suspended() => {
                    if suspension.is_none() {
                        suspension = Some(error);
                    }
                }
                Err(error) => items.push(BatchItem::failed(index, ErrorObject::from(&error))),
            }
        }
        match suspension {
            Some(error) => Err(error),
            None => Ok(Self::new(items)),
        }
    }

    /// Returns all succeeded items.
    pub fn succeeded(&self) -> Vec<&BatchItem<T>> {
        self.items.iter().filter(|item| item.is_succeeded()).collect()
    }

    /// Returns all failed items.
    pub fn failed(&self) -> Vec<&BatchItem<T>> {
        self.items.iter().filter(|item| item.is_failed()).collect()
    }

    /// Returns the number of succeeded items.
    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_succeeded()).count()
    }

    /// Returns the number of failed items.
    pub fn failure_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_failed()).count()
    }

    /// Returns the total number of items.
    pub fn total_count(&self) -> usize {
        self.items.len()
    }

    /// Returns true if all items succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|item| item.is_succeeded())
    }

    /// Collapses the batch into the item values, or the lowest-index failure.
    pub fn into_result(self) -> DurableResult<Vec<T>> {
        if let Some(failed) = self.items.iter().find(|item| item.is_failed()) {
            return Err(match failed.error {
                Some(ref error) => error.to_durable_error(),
                None => DurableError::execution(format!("Item {} failed", failed.index)),
            });
        }
        Ok(self.items.into_iter().filter_map(|item| item.result).collect())
    }
}

/// Keeps at most `max_concurrency` items in flight.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyController {
    max_concurrency: Option<usize>,
}

impl ConcurrencyController {
    /// Validates the configuration. A limit of zero is rejected.
    pub fn new(config: &ConcurrencyConfig) -> DurableResult<Self> {
        if config.max_concurrency == Some(0) {
            return Err(DurableError::validation("max_concurrency must be at least 1"));
        }
        Ok(Self {
            max_concurrency: config.max_concurrency,
        })
    }

    /// The configured limit; `None` means unbounded.
    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Runs every item and returns the results in index order.
    ///
    /// `launch` is called synchronously, in index order, when an item gets a
    /// slot; the future it returns is then polled alongside the others.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, mut launch: F) -> Vec<DurableResult<T>>
    where
        F: FnMut(usize, I) -> Fut,
        Fut: Future<Output = DurableResult<T>>,
    {
        let total = items.len();
        let limit = self.max_concurrency.unwrap_or(total).max(1);
        let mut queued = items.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut results: Vec<Option<DurableResult<T>>> = (0..total).map(|_| None).collect();

        loop {
            while in_flight.len() < limit {
                let Some((index, item)) = queued.next() else {
                    break;
                };
                tracing::trace!(index, in_flight = in_flight.len(), "Launching item");
                let fut = launch(index, item);
                in_flight.push(async move { (index, fut.await) });
            }
            match in_flight.next().await {
                Some((index, result)) => results[index] = Some(result),
                None => break,
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| Err(DurableError::execution(format!("Item {} never ran", index))))
            })
            .collect()
    }
}

async fn run_items<I, T, F, Fut>(
    controller: &ConcurrencyController,
    scope: &DurableContext,
    items: Vec<I>,
    func: &F,
    item_sub_type: OperationSubType,
) -> DurableResult<BatchResult<T>>
where
    I: Send,
    T: Serialize + DeserializeOwned + Send,
    F: Fn(DurableContext, I, usize) -> Fut + Send + Sync,
    Fut: Future<Output = DurableResult<T>> + Send,
{
    let results = controller
        .run(items, |index, item| {
            let item_id = scope.next_operation_identifier(None);
            async move {
                child_handler(
                    move |item_ctx| func(item_ctx, item, index),
                    scope,
                    &item_id,
                    item_sub_type,
                    &ChildConfig::default(),
                )
                .await
            }
        })
        .await;
    BatchResult::from_results(results)
}

/// Applies `func` to every item inside a `Map` child context.
pub async fn map_handler<I, T, F, Fut>(
    items: Vec<I>,
    func: F,
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
    config: ConcurrencyConfig,
) -> DurableResult<Vec<T>>
where
    I: Send,
    T: Serialize + DeserializeOwned + Send,
    F: Fn(DurableContext, I, usize) -> Fut + Send + Sync,
    Fut: Future<Output = DurableResult<T>> + Send,
{
    let controller = ConcurrencyController::new(&config)?;
    child_handler(
        move |scope: DurableContext| async move {
            run_items(&controller, &scope, items, &func, OperationSubType::MapIteration)
                .await?
                .into_result()
        },
        ctx,
        op_id,
        OperationSubType::Map,
        &ChildConfig::default(),
    )
    .await
}

/// Runs each branch inside a `Parallel` child context.
pub async fn parallel_handler<T, F, Fut>(
    branches: Vec<F>,
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
    config: ConcurrencyConfig,
) -> DurableResult<Vec<T>>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(DurableContext) -> Fut + Send,
    Fut: Future<Output = DurableResult<T>> + Send,
{
    let controller = ConcurrencyController::new(&config)?;
    child_handler(
        move |scope: DurableContext| async move {
            let scope = &scope;
            let results = controller
                .run(branches, |_, branch| {
                    let branch_id = scope.next_operation_identifier(None);
                    async move {
                        child_handler(
                            branch,
                            scope,
                            &branch_id,
                            OperationSubType::ParallelBranch,
                            &ChildConfig::default(),
                        )
                        .await
                    }
                })
                .await;
            BatchResult::from_results(results)?.into_result()
        },
        ctx,
        op_id,
        OperationSubType::Parallel,
        &ChildConfig::default(),
    )
    .await
}

/// Runs `func` over every item and records the whole [`BatchResult`].
pub async fn execute_concurrently_handler<I, T, F, Fut>(
    items: Vec<I>,
    func: F,
    ctx: &DurableContext,
    op_id: &OperationIdentifier,
    config: ConcurrencyConfig,
) -> DurableResult<BatchResult<T>>
where
    I: Send,
    T: Serialize + DeserializeOwned + Send,
    F: Fn(DurableContext, I, usize) -> Fut + Send + Sync,
    Fut: Future<Output = DurableResult<T>> + Send,
{
    let controller = ConcurrencyController::new(&config)?;
    child_handler(
        move |scope: DurableContext| async move {
            run_items(&controller, &scope, items, &func, OperationSubType::ConcurrentItem).await
        },
        ctx,
        op_id,
        OperationSubType::ConcurrentExecution,
        &ChildConfig::default(),
    )
    .await
}
