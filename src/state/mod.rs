//! Execution state and the checkpoint pipeline.
//!
//! - `checkpoint_result`: lookup results for recorded operations
//! - `replay_status`: replay/new tracking
//! - `batcher`: the checkpoint batching pipeline
//! - `execution_state`: per-invocation state shared by handlers
//!
//! ## Checkpoint tokens
//!
//! The first checkpoint call uses the token from the invocation input. Each
//! successful call returns the token for the next one, and the pipeline swaps
//! it in before resolving the batch. Tokens are never reused.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::operation::Operation;

mod batcher;
mod checkpoint_result;
mod execution_state;
mod replay_status;

pub use batcher::{
    create_checkpoint_queue, CheckpointBatcher, CheckpointCompletion, CheckpointJournal,
    CheckpointQueue, CheckpointRequest, CheckpointSender,
};
pub use checkpoint_result::{CheckpointedResult, RecordState};
pub use execution_state::ExecutionState;
pub use replay_status::ReplayStatus;

/// Step-data store shared between the state and the batcher.
pub type OperationMap = Arc<RwLock<HashMap<String, Operation>>>;
