//! Shared fixtures for in-crate handler tests.

use std::sync::Arc;

use crate::client::MockDurableServiceClient;
use crate::config::{ExecutionConfig, ModeFlags};
use crate::context::DurableContext;
use crate::invocation::InitialExecutionState;
use crate::operation::Operation;
use crate::state::ExecutionState;
use crate::termination::TerminationSignal;

pub(crate) struct Harness {
    pub ctx: DurableContext,
    pub client: Arc<MockDurableServiceClient>,
    pub termination: Arc<TerminationSignal>,
}

/// A root context in local mode, so recorded operations can be seeded by logical id.
pub(crate) fn harness(client: MockDurableServiceClient, recorded: Vec<Operation>) -> Harness {
    harness_with_config(client, recorded, ExecutionConfig::default())
}

pub(crate) fn harness_with_config(
    client: MockDurableServiceClient,
    recorded: Vec<Operation>,
    config: ExecutionConfig,
) -> Harness {
    let config = config.with_mode(ModeFlags {
        local: true,
        ..Default::default()
    });
    let client = Arc::new(client);
    let termination = Arc::new(TerminationSignal::new());
    let (state, batcher) = ExecutionState::with_pipeline(
        "exec-1",
        "token-0",
        InitialExecutionState::new(recorded),
        client.clone(),
        termination.clone(),
        config,
    );
    tokio::spawn(batcher.run());
    Harness {
        ctx: DurableContext::new(Arc::new(state)),
        client,
        termination,
    }
}
