//! Shared test utilities for integration tests.
//!
//! Provides a scriptable mock backend, a small in-memory backend simulator
//! that folds checkpoint updates into recorded operations between
//! invocations, operation builders and proptest strategies.

#![allow(dead_code)] // Each integration test binary uses a different subset

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use durable_execution_engine::client::{
    CheckpointResponse, DurableServiceClient, GetOperationsResponse, NewExecutionState,
};
use durable_execution_engine::config::{ExecutionConfig, ModeFlags};
use durable_execution_engine::error::{DurableError, ErrorObject};
use durable_execution_engine::invocation::{DurableExecutionInvocationInput, InitialExecutionState};
use durable_execution_engine::operation::{
    CallbackDetails, ContextDetails, ExecutionDetails, Operation, OperationAction,
    OperationStatus, OperationType, OperationUpdate, StepDetails,
};
use proptest::prelude::*;

pub const TEST_EXECUTION_ID: &str = "arn:test:durable-execution:order-1";
pub const TEST_CHECKPOINT_TOKEN: &str = "token-0";

static TRACING: Once = Once::new();

/// Routes engine logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// =============================================================================
// Mock Client for Integration Tests
// =============================================================================

/// Record of a checkpoint call for test verification.
#[derive(Debug, Clone)]
pub struct CheckpointCall {
    pub execution_id: String,
    pub checkpoint_token: String,
    pub operations: Vec<OperationUpdate>,
}

/// A scriptable [`DurableServiceClient`].
///
/// Unscripted checkpoint calls succeed with `token-{n}`. With callback ids
/// enabled, every callback `Start` is answered with a `Started` callback
/// whose id is `callback-{operation id}`.
#[derive(Default)]
pub struct MockDurableServiceClient {
    checkpoint_responses: Mutex<VecDeque<Result<CheckpointResponse, DurableError>>>,
    get_operations_responses: Mutex<VecDeque<Result<GetOperationsResponse, DurableError>>>,
    checkpoint_calls: Mutex<Vec<CheckpointCall>>,
    get_operations_calls: Mutex<Vec<String>>,
    latency: Option<StdDuration>,
    callback_ids: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    tokens: AtomicUsize,
}

impl MockDurableServiceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a checkpoint response to be returned on the next checkpoint call.
    pub fn with_checkpoint_response(self, response: Result<CheckpointResponse, DurableError>) -> Self {
        self.checkpoint_responses.lock().unwrap().push_back(response);
        self
    }

    /// Adds a get_operations response to be returned on the next get_operations call.
    pub fn with_get_operations_response(
        self,
        response: Result<GetOperationsResponse, DurableError>,
    ) -> Self {
        self.get_operations_responses.lock().unwrap().push_back(response);
        self
    }

    /// Delays every checkpoint call by `latency`.
    pub fn with_latency(mut self, latency: StdDuration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Assigns callback ids to callback `Start` updates.
    pub fn with_callback_ids(mut self) -> Self {
        self.callback_ids = true;
        self
    }

    /// Returns all checkpoint calls made to this mock.
    pub fn get_checkpoint_calls(&self) -> Vec<CheckpointCall> {
        self.checkpoint_calls.lock().unwrap().clone()
    }

    /// Every update sent, in call order.
    pub fn all_updates(&self) -> Vec<OperationUpdate> {
        self.get_checkpoint_calls()
            .into_iter()
            .flat_map(|call| call.operations)
            .collect()
    }

    /// Markers passed to get_operations.
    pub fn get_operations_calls(&self) -> Vec<String> {
        self.get_operations_calls.lock().unwrap().clone()
    }

    /// Highest number of checkpoint calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableServiceClient for MockDurableServiceClient {
    async fn checkpoint(
        &self,
        execution_id: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, DurableError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.checkpoint_calls.lock().unwrap().push(CheckpointCall {
            execution_id: execution_id.to_string(),
            checkpoint_token: checkpoint_token.to_string(),
            operations: operations.clone(),
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = self.checkpoint_responses.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut response = match scripted {
            Some(response) => response?,
            None => {
                let n = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
                CheckpointResponse::new(format!("token-{}", n))
            }
        };

        if self.callback_ids {
            let callbacks: Vec<Operation> = operations
                .iter()
                .filter(|u| u.operation_type == OperationType::Callback && u.action == OperationAction::Start)
                .map(|u| create_pending_callback(&u.operation_id, &format!("callback-{}", u.operation_id)))
                .collect();
            if !callbacks.is_empty() {
                response = response.with_operations(callbacks);
            }
        }
        Ok(response)
    }

    async fn get_operations(
        &self,
        _execution_id: &str,
        next_marker: &str,
    ) -> Result<GetOperationsResponse, DurableError> {
        self.get_operations_calls.lock().unwrap().push(next_marker.to_string());
        match self.get_operations_responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(GetOperationsResponse::default()),
        }
    }
}

// =============================================================================
// Backend Simulator
// =============================================================================

/// Folds checkpoint updates into recorded operations, the way the backend
/// would between invocations.
#[derive(Debug, Default, Clone)]
pub struct SimulatedBackend {
    operations: BTreeMap<String, Operation>,
    input: Option<String>,
}

impl SimulatedBackend {
    /// A backend for an execution started with `input`.
    pub fn new(input: serde_json::Value) -> Self {
        let input = input.to_string();
        let mut backend = Self {
            operations: BTreeMap::new(),
            input: Some(input.clone()),
        };
        backend.operations.insert(
            "execution".to_string(),
            create_execution_operation("execution", OperationStatus::Started, Some(&input)),
        );
        backend
    }

    /// Builds the input for the next invocation.
    pub fn invocation_input(&self) -> DurableExecutionInvocationInput {
        DurableExecutionInvocationInput {
            execution_id: TEST_EXECUTION_ID.to_string(),
            checkpoint_token: TEST_CHECKPOINT_TOKEN.to_string(),
            initial_execution_state: InitialExecutionState::new(self.operations.values().cloned().collect()),
            input: None,
        }
    }

    /// Applies every update the client saw.
    pub fn absorb(&mut self, client: &MockDurableServiceClient) {
        for update in client.all_updates() {
            self.apply(&update);
        }
    }

    pub fn apply(&mut self, update: &OperationUpdate) {
        let op = self
            .operations
            .entry(update.operation_id.clone())
            .or_insert_with(|| {
                let mut op = Operation::new(&update.operation_id, update.operation_type);
                op.parent_id = update.parent_id.clone();
                op.name = update.name.clone();
                op.sub_type = update.sub_type;
                op
            });
        match update.action {
            OperationAction::Start => {
                op.status = OperationStatus::Started;
                if update.operation_type == OperationType::Callback && op.callback_details.is_none() {
                    op.callback_details = Some(CallbackDetails {
                        callback_id: Some(format!("callback-{}", update.operation_id)),
                    });
                }
            }
            OperationAction::Succeed => {
                op.status = OperationStatus::Succeeded;
                op.result = update.payload.clone();
                if let Some(ref options) = update.context_options {
                    op.context_details = Some(ContextDetails {
                        replay_children: Some(options.replay_children),
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
            _ => {}
        }
    }

    /// Lets time pass: started waits elapse and pending retries become due.
    pub fn advance_time(&mut self) {
        for op in self.operations.values_mut() {
            match (op.operation_type, op.status) {
                (OperationType::Wait, OperationStatus::Started) => op.status = OperationStatus::Succeeded,
                (OperationType::Step, OperationStatus::Pending) => op.status = OperationStatus::Ready,
                _ => {}
            }
        }
    }

    /// Completes the callback with the given id.
    pub fn complete_callback(&mut self, callback_id: &str, result: &str) -> bool {
        for op in self.operations.values_mut() {
            if op.callback_id() == Some(callback_id) {
                op.status = OperationStatus::Succeeded;
                op.result = Some(result.to_string());
                return true;
            }
        }
        false
    }

    /// Callback ids of callbacks still waiting for completion.
    pub fn pending_callback_ids(&self) -> Vec<String> {
        self.operations
            .values()
            .filter(|op| op.operation_type == OperationType::Callback && op.status == OperationStatus::Started)
            .filter_map(|op| op.callback_id().map(str::to_string))
            .collect()
    }

    pub fn operation(&self, operation_id: &str) -> Option<&Operation> {
        self.operations.get(operation_id)
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.operations.values().cloned().collect()
    }
}

// =============================================================================
// Test Helper Functions
// =============================================================================

/// Engine config with readable logical ids as wire ids.
pub fn local_config() -> ExecutionConfig {
    init_tracing();
    ExecutionConfig::default().with_mode(ModeFlags {
        local: true,
        ..Default::default()
    })
}

/// Engine config with hashed wire ids.
pub fn hashed_config() -> ExecutionConfig {
    init_tracing();
    ExecutionConfig::default()
}

/// Builds an invocation input carrying `operations`.
pub fn invocation_input(operations: Vec<Operation>, input: Option<serde_json::Value>) -> DurableExecutionInvocationInput {
    DurableExecutionInvocationInput {
        execution_id: TEST_EXECUTION_ID.to_string(),
        checkpoint_token: TEST_CHECKPOINT_TOKEN.to_string(),
        initial_execution_state: InitialExecutionState::new(operations),
        input,
    }
}

/// Creates a simple CheckpointResponse with just a token.
pub fn create_checkpoint_response(token: &str) -> CheckpointResponse {
    CheckpointResponse::new(token)
}

/// Creates a GetOperationsResponse page.
pub fn create_operations_page(operations: Vec<Operation>, next_marker: Option<&str>) -> GetOperationsResponse {
    GetOperationsResponse {
        operations,
        next_marker: next_marker.map(str::to_string),
    }
}

/// Creates a CheckpointResponse with operations in the new execution state.
pub fn create_checkpoint_response_with_operations(token: &str, operations: Vec<Operation>) -> CheckpointResponse {
    CheckpointResponse {
        checkpoint_token: token.to_string(),
        new_execution_state: Some(NewExecutionState {
            operations,
            next_marker: None,
        }),
    }
}

/// Creates an Operation with the specified type and status.
pub fn create_operation(id: &str, op_type: OperationType, status: OperationStatus) -> Operation {
    Operation::new(id, op_type).with_status(status)
}

/// Creates a completed STEP operation with a result.
pub fn create_completed_step(id: &str, result: &str) -> Operation {
    create_operation(id, OperationType::Step, OperationStatus::Succeeded).with_result(result)
}

/// Creates a STEP operation waiting for a retry.
pub fn create_pending_step(id: &str, attempt: u32) -> Operation {
    create_operation(id, OperationType::Step, OperationStatus::Pending).with_attempt(attempt)
}

/// Creates a failed STEP operation with an error.
pub fn create_failed_step(id: &str, error_type: &str, error_message: &str) -> Operation {
    create_operation(id, OperationType::Step, OperationStatus::Failed)
        .with_error(ErrorObject::new(error_type, error_message))
}

/// Creates a completed WAIT operation.
pub fn create_completed_wait(id: &str) -> Operation {
    create_operation(id, OperationType::Wait, OperationStatus::Succeeded)
}

/// Creates a CALLBACK operation that has not been completed yet.
pub fn create_pending_callback(id: &str, callback_id: &str) -> Operation {
    let mut op = create_operation(id, OperationType::Callback, OperationStatus::Started);
    op.callback_details = Some(CallbackDetails {
        callback_id: Some(callback_id.to_string()),
    });
    op
}

/// Creates a completed CALLBACK operation with a result.
pub fn create_completed_callback(id: &str, callback_id: &str, result: &str) -> Operation {
    let mut op = create_pending_callback(id, callback_id).with_result(result);
    op.status = OperationStatus::Succeeded;
    op
}

/// Creates a CONTEXT operation with the specified status.
pub fn create_context_operation(id: &str, status: OperationStatus, parent_id: Option<&str>) -> Operation {
    let mut op = create_operation(id, OperationType::Context, status);
    op.parent_id = parent_id.map(str::to_string);
    op
}

/// Creates an EXECUTION operation (root operation).
pub fn create_execution_operation(id: &str, status: OperationStatus, input: Option<&str>) -> Operation {
    let mut op = create_operation(id, OperationType::Execution, status);
    op.execution_details = Some(ExecutionDetails {
        input_payload: input.map(str::to_string),
    });
    op
}

/// The mock as the shared client type the driver takes.
pub fn shared(client: &Arc<MockDurableServiceClient>) -> Arc<dyn DurableServiceClient> {
    client.clone()
}

// =============================================================================
// Proptest Strategies
// =============================================================================

/// Strategy for generating terminal OperationStatus values.
pub fn terminal_status_strategy() -> impl Strategy<Value = OperationStatus> {
    prop_oneof![
        Just(OperationStatus::Succeeded),
        Just(OperationStatus::Failed),
        Just(OperationStatus::Cancelled),
        Just(OperationStatus::TimedOut),
        Just(OperationStatus::Stopped),
    ]
}

/// Strategy for generating operation types that user code can request.
pub fn user_operation_type_strategy() -> impl Strategy<Value = OperationType> {
    prop_oneof![
        Just(OperationType::Step),
        Just(OperationType::Wait),
        Just(OperationType::Callback),
        Just(OperationType::Context),
    ]
}
