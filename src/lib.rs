//! # Durable Execution Replay Engine
//!
//! This crate runs workflows that survive restarts by recording every
//! side-effecting operation in a backend and replaying the workflow from the
//! top on each invocation. Completed operations return their recorded result
//! without running user code again; the first operation without a terminal
//! record runs for real and is checkpointed.
//!
//! ## Overview
//!
//! An invocation goes through these parts:
//!
//! - **Operation ids** ([`context`]): each scope hands out ids `1, 2, 3, ...`;
//!   child scopes prefix them with the parent's id (`2-1`, `2-2`). The wire id
//!   is a Blake2b hash of that logical id.
//! - **Checkpoint pipeline** ([`state`]): updates are queued and sent in
//!   batches, one backend call at a time, each call chaining the checkpoint
//!   token returned by the previous one.
//! - **Handlers** ([`handlers`]): the replay state machine for steps, child
//!   contexts, waits and callbacks.
//! - **Bounded fan-out** ([`concurrency`]): `map`, `parallel` and
//!   `execute_concurrently` with an optional concurrency limit.
//! - **Retry policy** ([`retry`]): decides whether a failed step is retried
//!   and after what delay.
//! - **Termination and driver** ([`termination`], [`invocation`]): operations
//!   that must pause suspend the invocation; the driver reports `SUCCEEDED`,
//!   `FAILED` or `PENDING` once all checkpoints are durable.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use durable_execution_engine::{
//!     run_durable_invocation, DurableContext, DurableError, Duration, ExecutionConfig,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct OrderEvent {
//!     order_id: String,
//!     amount: u64,
//! }
//!
//! #[derive(Serialize)]
//! struct Receipt {
//!     order_id: String,
//!     payment_id: String,
//! }
//!
//! async fn process_order(event: OrderEvent, ctx: DurableContext) -> Result<Receipt, DurableError> {
//!     let payment_id: String = ctx
//!         .step_named("charge", |_| async move { charge(event.amount).await }, None)
//!         .await?;
//!
//!     // Suspends the invocation; the backend re-invokes once the hour is up.
//!     ctx.wait(Duration::from_hours(1)).await?;
//!
//!     ctx.step_named("notify", |_| async { notify().await }, None).await?;
//!     Ok(Receipt { order_id: event.order_id, payment_id })
//! }
//!
//! let output = run_durable_invocation(input, client, ExecutionConfig::from_env(), process_order).await?;
//! ```
//!
//! ## Determinism
//!
//! Ids depend only on the order of durable calls within a scope, so a workflow
//! must issue the same durable operations in the same order on every replay.
//! Non-durable work (clock reads, random numbers, I/O) belongs inside steps.
//! A replay that finds a different operation type at an id fails the
//! execution as non-deterministic.
//!
//! ## Modes
//!
//! [`ModeFlags`] are read once from `DURABLE_LOCAL_MODE`,
//! `DURABLE_VERBOSE_MODE` and `DURABLE_RECORD_MODE`:
//!
//! - local: logical ids are used as wire ids, which keeps local runs readable
//! - verbose: user logs are not suppressed while replaying
//! - record: every flushed batch is kept and readable through
//!   [`ExecutionState::recorded_batches`]

pub mod client;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod duration;
pub mod error;
pub mod handlers;
pub mod invocation;
pub mod operation;
pub mod retry;
pub mod serdes;
pub mod state;
pub mod termination;

#[cfg(test)]
mod test_support;

pub use client::{
    CheckpointResponse, DurableServiceClient, GetOperationsResponse, NewExecutionState,
    SharedDurableServiceClient,
};
pub use concurrency::{BatchItem, BatchItemStatus, BatchResult, ConcurrencyController};
pub use config::{
    CallbackConfig, ChildConfig, ConcurrencyConfig, ExecutionConfig, ModeFlags, StepConfig,
    StepSemantics,
};
pub use context::{
    hash_operation_id, DurableContext, LogInfo, Logger, OperationIdGenerator,
    OperationIdentifier, ReplayAwareLogger, ReplayLoggingConfig, TracingLogger,
};
pub use duration::Duration;
pub use error::{DurableError, DurableResult, ErrorObject, StepError, TerminationReason};
pub use handlers::{Callback, StepContext};
pub use invocation::{
    run_durable_invocation, DurableExecutionInvocationInput, DurableExecutionInvocationOutput,
    InitialExecutionState, InvocationStatus,
};
pub use operation::{
    CallbackDetails, CallbackOptions, ContextDetails, ContextOptions, ExecutionDetails,
    Operation, OperationAction, OperationStatus, OperationSubType, OperationType,
    OperationUpdate, StepDetails, StepOptions, WaitDetails, WaitOptions,
};
pub use retry::{
    ExponentialBackoff, FnRetryStrategy, NoRetry, RetryDecision, RetryPresets, RetryStrategy,
};
pub use serdes::{JsonSerDes, SerDes, SerDesContext, SerDesError};
pub use state::{CheckpointedResult, ExecutionState, RecordState, ReplayStatus};
pub use termination::{Outcome, TerminationDetails, TerminationSignal};
