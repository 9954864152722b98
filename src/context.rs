//! The durable context handed to user code.
//!
//! A [`DurableContext`] is one scope of a workflow: it owns a step counter and
//! an optional id prefix, and every operation it runs takes the next id from
//! that counter. Child contexts get a fresh counter whose prefix is the
//! logical id of the entity that created them, so ids form a tree:
//!
//! ```text
//! root        1, 2, 3
//! child "2"   2-1, 2-2
//! child "2-2" 2-2-1
//! ```
//!
//! Ids are a pure function of call order within a scope. User code must call
//! durable operations in the same order on every replay.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blake2::{Blake2b512, Digest};
use serde::{de::DeserializeOwned, Serialize};

use crate::concurrency::{self, BatchResult};
use crate::config::{CallbackConfig, ChildConfig, ConcurrencyConfig, StepConfig};
use crate::duration::Duration;
use crate::error::{DurableResult, StepError};
use crate::handlers::{callback_handler, child_handler, step_handler, wait_handler, Callback, StepContext};
use crate::operation::{OperationSubType, OperationUpdate};
use crate::state::ExecutionState;

/// Hashes a logical id into the opaque wire id stored by the backend.
///
/// Blake2b-512 over the logical id, hex-encoding the first 16 bytes.
pub fn hash_operation_id(logical_id: &str) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(logical_id.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Deterministic id source for one scope.
#[derive(Debug)]
pub struct OperationIdGenerator {
    prefix: Option<String>,
    counter: AtomicU64,
}

impl OperationIdGenerator {
    /// Creates a generator; ids are `prefix-n` with a prefix, `n` without.
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    /// Allocates the next logical id.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        match self.prefix {
            Some(ref prefix) => format!("{}-{}", prefix, n),
            None => n.to_string(),
        }
    }

    /// Number of ids handed out so far.
    pub fn current_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// The scope prefix.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Identity of one durable operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationIdentifier {
    /// Wire id (hashed unless local mode is on)
    pub operation_id: String,
    /// Logical id, e.g. `2-1`
    pub logical_id: String,
    /// Wire id of the enclosing context entity
    pub parent_id: Option<String>,
    /// Optional name
    pub name: Option<String>,
}

impl OperationIdentifier {
    /// Copies parent and name onto an update for this operation.
    pub(crate) fn apply_to(&self, mut update: OperationUpdate) -> OperationUpdate {
        update.parent_id = self.parent_id.clone();
        update.name = self.name.clone();
        update
    }
}

impl std::fmt::Display for OperationIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name {
            Some(ref name) => write!(f, "{} ({})", name, self.logical_id),
            None => write!(f, "{}", self.logical_id),
        }
    }
}

/// Structured fields attached to every log line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogInfo {
    /// The execution the message belongs to
    pub execution_id: String,
    /// The operation, if any
    pub operation_id: Option<String>,
    /// The enclosing context, if any
    pub parent_id: Option<String>,
    /// True when emitted while replaying recorded operations
    pub is_replay: bool,
}

impl LogInfo {
    /// Creates log info for an execution.
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            ..Default::default()
        }
    }

    /// Sets the operation id.
    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    /// Sets the parent id.
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the replay flag.
    pub fn with_replay(mut self, is_replay: bool) -> Self {
        self.is_replay = is_replay;
        self
    }
}

/// Sink for handler and user logs.
pub trait Logger: Send + Sync {
    /// Logs at debug level.
    fn debug(&self, message: &str, info: &LogInfo);
    /// Logs at info level.
    fn info(&self, message: &str, info: &LogInfo);
    /// Logs at warn level.
    fn warn(&self, message: &str, info: &LogInfo);
    /// Logs at error level.
    fn error(&self, message: &str, info: &LogInfo);
}

/// Forwards to `tracing` with the log info as fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str, info: &LogInfo) {
        tracing::debug!(
            execution_id = %info.execution_id,
            operation_id = ?info.operation_id,
            parent_id = ?info.parent_id,
            is_replay = info.is_replay,
            "{}",
            message
        );
    }

    fn info(&self, message: &str, info: &LogInfo) {
        tracing::info!(
            execution_id = %info.execution_id,
            operation_id = ?info.operation_id,
            parent_id = ?info.parent_id,
            is_replay = info.is_replay,
            "{}",
            message
        );
    }

    fn warn(&self, message: &str, info: &LogInfo) {
        tracing::warn!(
            execution_id = %info.execution_id,
            operation_id = ?info.operation_id,
            parent_id = ?info.parent_id,
            is_replay = info.is_replay,
            "{}",
            message
        );
    }

    fn error(&self, message: &str, info: &LogInfo) {
        tracing::error!(
            execution_id = %info.execution_id,
            operation_id = ?info.operation_id,
            parent_id = ?info.parent_id,
            is_replay = info.is_replay,
            "{}",
            message
        );
    }
}

/// Which messages survive while replaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayLoggingConfig {
    /// Drop everything logged during replay
    #[default]
    SuppressAll,
    /// Keep errors only
    ErrorsOnly,
    /// Keep everything
    AllowAll,
}

/// Wraps a logger and filters messages logged during replay.
///
/// Replayed code runs again on every invocation; without filtering the same
/// lines would be logged once per invocation.
pub struct ReplayAwareLogger {
    inner: Arc<dyn Logger>,
    config: ReplayLoggingConfig,
}

impl ReplayAwareLogger {
    /// Wraps `inner` with the given policy.
    pub fn new(inner: Arc<dyn Logger>, config: ReplayLoggingConfig) -> Self {
        Self { inner, config }
    }

    /// Drops every replay-time message.
    pub fn suppress_replay(inner: Arc<dyn Logger>) -> Self {
        Self::new(inner, ReplayLoggingConfig::SuppressAll)
    }

    /// Keeps every message.
    pub fn allow_all(inner: Arc<dyn Logger>) -> Self {
        Self::new(inner, ReplayLoggingConfig::AllowAll)
    }

    fn keep(&self, info: &LogInfo, is_error: bool) -> bool {
        if !info.is_replay {
            return true;
        }
        match self.config {
            ReplayLoggingConfig::SuppressAll => false,
            ReplayLoggingConfig::ErrorsOnly => is_error,
            ReplayLoggingConfig::AllowAll => true,
        }
    }
}

impl Logger for ReplayAwareLogger {
    fn debug(&self, message: &str, info: &LogInfo) {
        if self.keep(info, false) {
            self.inner.debug(message, info);
        }
    }

    fn info(&self, message: &str, info: &LogInfo) {
        if self.keep(info, false) {
            self.inner.info(message, info);
        }
    }

    fn warn(&self, message: &str, info: &LogInfo) {
        if self.keep(info, false) {
            self.inner.warn(message, info);
        }
    }

    fn error(&self, message: &str, info: &LogInfo) {
        if self.keep(info, true) {
            self.inner.error(message, info);
        }
    }
}

impl std::fmt::Debug for ReplayAwareLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayAwareLogger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One scope of a durable workflow.
///
/// Cloning is cheap; clones share the same step counter.
#[derive(Clone)]
pub struct DurableContext {
    state: Arc<ExecutionState>,
    id_generator: Arc<OperationIdGenerator>,
    parent_id: Option<String>,
    logger: Arc<dyn Logger>,
}

impl DurableContext {
    /// Creates the root context of an execution.
    pub fn new(state: Arc<ExecutionState>) -> Self {
        Self {
            state,
            id_generator: Arc::new(OperationIdGenerator::new(None)),
            parent_id: None,
            logger: Arc::new(TracingLogger),
        }
    }

    /// Replaces the logger used by this context and its children.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// The shared execution state.
    pub fn state(&self) -> &Arc<ExecutionState> {
        &self.state
    }

    /// The execution id.
    pub fn execution_id(&self) -> &str {
        self.state.execution_id()
    }

    /// Wire id of the entity this scope belongs to; `None` at the root.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// The raw logger used by handlers.
    pub(crate) fn handler_logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    /// Allocates the identity of the next operation in this scope.
    pub fn next_operation_identifier(&self, name: Option<&str>) -> OperationIdentifier {
        let logical_id = self.id_generator.next_id();
        let operation_id = if self.state.mode().local {
            logical_id.clone()
        } else {
            hash_operation_id(&logical_id)
        };
        OperationIdentifier {
            operation_id,
            logical_id,
            parent_id: self.parent_id.clone(),
            name: name.map(str::to_string),
        }
    }

    /// Creates the scope nested under `entity`.
    pub(crate) fn create_child_context(&self, entity: &OperationIdentifier) -> DurableContext {
        Self {
            state: self.state.clone(),
            id_generator: Arc::new(OperationIdGenerator::new(Some(entity.logical_id.clone()))),
            parent_id: Some(entity.operation_id.clone()),
            logger: self.logger.clone(),
        }
    }

    /// Log fields for this scope.
    pub fn log_fields(&self) -> LogInfo {
        let mut info = LogInfo::new(self.execution_id()).with_replay(self.state.is_replay());
        if let Some(ref parent_id) = self.parent_id {
            info = info.with_parent_id(parent_id);
        }
        info
    }

    /// A logger that drops messages logged while replaying, unless verbose mode is on.
    pub fn logger(&self) -> Arc<dyn Logger> {
        let config = if self.state.mode().verbose {
            ReplayLoggingConfig::AllowAll
        } else {
            ReplayLoggingConfig::SuppressAll
        };
        Arc::new(ReplayAwareLogger::new(self.logger.clone(), config))
    }

    /// Logs a debug message through the replay-aware logger.
    pub fn log_debug(&self, message: &str) {
        self.logger().debug(message, &self.log_fields());
    }

    /// Logs an info message through the replay-aware logger.
    pub fn log_info(&self, message: &str) {
        self.logger().info(message, &self.log_fields());
    }

    /// Logs a warning through the replay-aware logger.
    pub fn log_warn(&self, message: &str) {
        self.logger().warn(message, &self.log_fields());
    }

    /// Logs an error through the replay-aware logger.
    pub fn log_error(&self, message: &str) {
        self.logger().error(message, &self.log_fields());
    }

    /// Runs a step.
    pub async fn step<T, F, Fut>(&self, func: F, config: Option<StepConfig>) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(StepContext) -> Fut + Send,
        Fut: Future<Output = Result<T, StepError>> + Send,
    {
        let op_id = self.next_operation_identifier(None);
        step_handler(func, self, &op_id, OperationSubType::Step, &config.unwrap_or_default()).await
    }

    /// Runs a named step.
    pub async fn step_named<T, F, Fut>(
        &self,
        name: &str,
        func: F,
        config: Option<StepConfig>,
    ) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(StepContext) -> Fut + Send,
        Fut: Future<Output = Result<T, StepError>> + Send,
    {
        let op_id = self.next_operation_identifier(Some(name));
        step_handler(func, self, &op_id, OperationSubType::Step, &config.unwrap_or_default()).await
    }

    /// Runs `func` in a nested scope whose result is checkpointed as one unit.
    pub async fn run_in_child_context<T, F, Fut>(
        &self,
        func: F,
        config: Option<ChildConfig>,
    ) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(DurableContext) -> Fut + Send,
        Fut: Future<Output = DurableResult<T>> + Send,
    {
        let op_id = self.next_operation_identifier(None);
        child_handler(
            func,
            self,
            &op_id,
            OperationSubType::RunInChildContext,
            &config.unwrap_or_default(),
        )
        .await
    }

    /// Named variant of [`run_in_child_context`](Self::run_in_child_context).
    pub async fn run_in_child_context_named<T, F, Fut>(
        &self,
        name: &str,
        func: F,
        config: Option<ChildConfig>,
    ) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(DurableContext) -> Fut + Send,
        Fut: Future<Output = DurableResult<T>> + Send,
    {
        let op_id = self.next_operation_identifier(Some(name));
        child_handler(
            func,
            self,
            &op_id,
            OperationSubType::RunInChildContext,
            &config.unwrap_or_default(),
        )
        .await
    }

    /// Suspends the workflow for `duration` (at least one second).
    pub async fn wait(&self, duration: Duration) -> DurableResult<()> {
        let op_id = self.next_operation_identifier(None);
        wait_handler(duration, self, &op_id).await
    }

    /// Named variant of [`wait`](Self::wait).
    pub async fn wait_named(&self, name: &str, duration: Duration) -> DurableResult<()> {
        let op_id = self.next_operation_identifier(Some(name));
        wait_handler(duration, self, &op_id).await
    }

    /// Registers a callback an external system can complete.
    pub async fn create_callback<T>(&self, config: Option<CallbackConfig>) -> DurableResult<Callback<T>>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let op_id = self.next_operation_identifier(None);
        callback_handler(self, &op_id, &config.unwrap_or_default()).await
    }

    /// Named variant of [`create_callback`](Self::create_callback).
    pub async fn create_callback_named<T>(
        &self,
        name: &str,
        config: Option<CallbackConfig>,
    ) -> DurableResult<Callback<T>>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let op_id = self.next_operation_identifier(Some(name));
        callback_handler(self, &op_id, &config.unwrap_or_default()).await
    }

    /// Creates a callback, hands its id to `submitter` inside a step, and waits for the result.
    pub async fn wait_for_callback<T, F, Fut>(
        &self,
        submitter: F,
        config: Option<CallbackConfig>,
    ) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(String, StepContext) -> Fut + Send,
        Fut: Future<Output = Result<(), StepError>> + Send,
    {
        let op_id = self.next_operation_identifier(None);
        crate::handlers::wait_for_callback_handler(submitter, self, &op_id, config.unwrap_or_default())
            .await
    }

    /// Applies `func` to every item, each in its own scope, with bounded concurrency.
    ///
    /// Every item runs to completion; afterwards the failure with the lowest
    /// index, if any, is returned.
    pub async fn map<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        func: F,
        config: Option<ConcurrencyConfig>,
    ) -> DurableResult<Vec<T>>
    where
        I: Send,
        T: Serialize + DeserializeOwned + Send,
        F: Fn(DurableContext, I, usize) -> Fut + Send + Sync,
        Fut: Future<Output = DurableResult<T>> + Send,
    {
        let op_id = self.next_operation_identifier(None);
        concurrency::map_handler(items, func, self, &op_id, config.unwrap_or_default()).await
    }

    /// Runs independent branches, each in its own scope, with bounded concurrency.
    pub async fn parallel<T, F, Fut>(
        &self,
        branches: Vec<F>,
        config: Option<ConcurrencyConfig>,
    ) -> DurableResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(DurableContext) -> Fut + Send,
        Fut: Future<Output = DurableResult<T>> + Send,
    {
        let op_id = self.next_operation_identifier(None);
        concurrency::parallel_handler(branches, self, &op_id, config.unwrap_or_default()).await
    }

    /// Runs `func` over `items` and reports every item's outcome instead of failing fast.
    pub async fn execute_concurrently<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        func: F,
        config: Option<ConcurrencyConfig>,
    ) -> DurableResult<BatchResult<T>>
    where
        I: Send,
        T: Serialize + DeserializeOwned + Send,
        F: Fn(DurableContext, I, usize) -> Fut + Send + Sync,
        Fut: Future<Output = DurableResult<T>> + Send,
    {
        let op_id = self.next_operation_identifier(None);
        concurrency::execute_concurrently_handler(items, func, self, &op_id, config.unwrap_or_default())
            .await
    }
}

impl std::fmt::Debug for DurableContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableContext")
            .field("execution_id", &self.execution_id())
            .field("prefix", &self.id_generator.prefix())
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::client::MockDurableServiceClient;
    use crate::config::{ExecutionConfig, ModeFlags};
    use crate::invocation::InitialExecutionState;
    use crate::operation::{Operation, OperationStatus, OperationType};
    use crate::termination::TerminationSignal;
    use proptest::prelude::*;

    fn state_with(mode: ModeFlags, operations: Vec<Operation>) -> Arc<ExecutionState> {
        let (state, batcher) = ExecutionState::with_pipeline(
            "exec-1",
            "token-0",
            InitialExecutionState::new(operations),
            Arc::new(MockDurableServiceClient::new()),
            Arc::new(TerminationSignal::new()),
            ExecutionConfig::default().with_mode(mode),
        );
        tokio::spawn(batcher.run());
        Arc::new(state)
    }

    #[derive(Default)]
    struct CapturingLogger {
        lines: Mutex<Vec<String>>,
    }

    impl Logger for CapturingLogger {
        fn debug(&self, message: &str, _info: &LogInfo) {
            self.lines.lock().unwrap().push(format!("debug {}", message));
        }
        fn info(&self, message: &str, _info: &LogInfo) {
            self.lines.lock().unwrap().push(format!("info {}", message));
        }
        fn warn(&self, message: &str, _info: &LogInfo) {
            self.lines.lock().unwrap().push(format!("warn {}", message));
        }
        fn error(&self, message: &str, _info: &LogInfo) {
            self.lines.lock().unwrap().push(format!("error {}", message));
        }
    }

    #[test]
    fn test_id_generator_without_prefix() {
        let generator = OperationIdGenerator::new(None);
        assert_eq!(generator.next_id(), "1");
        assert_eq!(generator.next_id(), "2");
        assert_eq!(generator.next_id(), "3");
        assert_eq!(generator.current_count(), 3);
    }

    #[test]
    fn test_id_generator_with_prefix() {
        let generator = OperationIdGenerator::new(Some("1-2".to_string()));
        assert_eq!(generator.next_id(), "1-2-1");
        assert_eq!(generator.next_id(), "1-2-2");
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let first = hash_operation_id("1-2");
        assert_eq!(first, hash_operation_id("1-2"));
        assert_ne!(first, hash_operation_id("1-3"));
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_child_scope_prefix_and_parent() {
        let ctx = DurableContext::new(state_with(ModeFlags::default(), vec![]));
        ctx.next_operation_identifier(None);
        let entity = ctx.next_operation_identifier(Some("batch"));
        assert_eq!(entity.logical_id, "2");
        assert_eq!(entity.operation_id, hash_operation_id("2"));
        assert_eq!(entity.name.as_deref(), Some("batch"));

        let child = ctx.create_child_context(&entity);
        let first = child.next_operation_identifier(None);
        assert_eq!(first.logical_id, "2-1");
        assert_eq!(first.parent_id.as_deref(), Some(entity.operation_id.as_str()));

        let grandchild = child.create_child_context(&first);
        assert_eq!(grandchild.next_operation_identifier(None).logical_id, "2-1-1");
    }

    #[tokio::test]
    async fn test_local_mode_uses_logical_ids() {
        let mode = ModeFlags {
            local: true,
            ..Default::default()
        };
        let ctx = DurableContext::new(state_with(mode, vec![]));
        let op = ctx.next_operation_identifier(None);
        assert_eq!(op.operation_id, "1");
    }

    #[tokio::test]
    async fn test_logger_suppressed_during_replay() {
        let recorded = vec![Operation::new("x", OperationType::Step).with_status(OperationStatus::Succeeded)];
        let capture = Arc::new(CapturingLogger::default());
        let ctx = DurableContext::new(state_with(ModeFlags::default(), recorded)).with_logger(capture.clone());

        ctx.log_info("replaying");
        assert!(capture.lines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logger_kept_in_verbose_mode() {
        let recorded = vec![Operation::new("x", OperationType::Step).with_status(OperationStatus::Succeeded)];
        let mode = ModeFlags {
            verbose: true,
            ..Default::default()
        };
        let capture = Arc::new(CapturingLogger::default());
        let ctx = DurableContext::new(state_with(mode, recorded)).with_logger(capture.clone());

        ctx.log_info("replaying");
        assert_eq!(capture.lines.lock().unwrap().as_slice(), ["info replaying"]);
    }

    #[test]
    fn test_replay_aware_errors_only() {
        let capture = Arc::new(CapturingLogger::default());
        let logger = ReplayAwareLogger::new(capture.clone(), ReplayLoggingConfig::ErrorsOnly);
        let info = LogInfo::new("exec").with_replay(true);
        logger.info("dropped", &info);
        logger.error("kept", &info);
        logger.info("live", &LogInfo::new("exec"));
        assert_eq!(capture.lines.lock().unwrap().as_slice(), ["error kept", "info live"]);
    }

    proptest! {
        #[test]
        fn prop_id_sequences_are_deterministic(prefix in proptest::option::of("[0-9]{1,3}(-[0-9]{1,3}){0,2}"), count in 1usize..50) {
            let a = OperationIdGenerator::new(prefix.clone());
            let b = OperationIdGenerator::new(prefix.clone());
            for i in 1..=count {
                let id = a.next_id();
                prop_assert_eq!(&id, &b.next_id());
                let expected = match prefix {
                    Some(ref p) => format!("{}-{}", p, i),
                    None => i.to_string(),
                };
                prop_assert_eq!(id, expected);
            }
        }
    }
}
