//! Backend client interface.
//!
//! The engine talks to the durable execution backend through
//! [`DurableServiceClient`]: one call to write a batch of checkpoint updates and
//! one paginated call to read previously recorded operations. Transport,
//! credentials and network retries belong to the implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DurableError;
use crate::operation::{Operation, OperationUpdate};

/// Trait for communicating with the durable execution backend.
#[async_trait]
pub trait DurableServiceClient: Send + Sync {
    /// Writes a batch of checkpoint updates.
    ///
    /// `checkpoint_token` is consumed by the call; the response carries the
    /// token for the next one. An empty `operations` list only refreshes the
    /// token.
    async fn checkpoint(
        &self,
        execution_id: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, DurableError>;

    /// Reads one page of recorded operations.
    async fn get_operations(
        &self,
        execution_id: &str,
        next_marker: &str,
    ) -> Result<GetOperationsResponse, DurableError>;
}

/// Type alias for a shared client.
pub type SharedDurableServiceClient = Arc<dyn DurableServiceClient>;

/// Response from a checkpoint call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    /// Token for the next checkpoint call
    #[serde(default)]
    pub checkpoint_token: String,

    /// Operations whose state the backend changed, e.g. callbacks that were assigned an id
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_execution_state: Option<NewExecutionState>,
}

impl CheckpointResponse {
    /// Creates a response carrying only a token.
    pub fn new(checkpoint_token: impl Into<String>) -> Self {
        Self {
            checkpoint_token: checkpoint_token.into(),
            new_execution_state: None,
        }
    }

    /// Attaches updated operations.
    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.new_execution_state = Some(NewExecutionState {
            operations,
            next_marker: None,
        });
        self
    }
}

/// Operations returned alongside a checkpoint response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewExecutionState {
    /// The updated operations
    #[serde(default)]
    pub operations: Vec<Operation>,

    /// Marker for further pages, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

/// One page of recorded operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GetOperationsResponse {
    /// The operations on this page
    #[serde(default)]
    pub operations: Vec<Operation>,

    /// Marker for the next page, `None` on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

#[cfg(test)]
pub(crate) use mock::{CheckpointCall, MockDurableServiceClient};
