//! Configuration for the engine and for individual operations.
//!
//! [`ExecutionConfig`] is built once per invocation and threaded through
//! [`ExecutionState`](crate::state::ExecutionState). The per-operation structs
//! ([`StepConfig`], [`ChildConfig`], [`CallbackConfig`], [`ConcurrencyConfig`])
//! are passed to individual calls on [`DurableContext`](crate::DurableContext).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};

use crate::duration::Duration;
use crate::retry::{RetryPresets, RetryStrategy};

/// Environment variable enabling local mode.
pub const LOCAL_MODE_ENV: &str = "DURABLE_LOCAL_MODE";
/// Environment variable enabling verbose mode.
pub const VERBOSE_MODE_ENV: &str = "DURABLE_VERBOSE_MODE";
/// Environment variable enabling record mode.
pub const RECORD_MODE_ENV: &str = "DURABLE_RECORD_MODE";

/// Child results larger than this are checkpointed as a sentinel.
pub const DEFAULT_LARGE_PAYLOAD_THRESHOLD_BYTES: usize = 256 * 1024;

/// Mode flags read once at invocation start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags {
    /// Use logical ids verbatim as wire ids instead of hashing them.
    pub local: bool,
    /// Keep logs emitted while replaying.
    pub verbose: bool,
    /// Keep a journal of every flushed checkpoint batch.
    pub record: bool,
}

impl ModeFlags {
    /// Reads the flags from the process environment.
    ///
    /// A flag is on when its variable is `1`, `true` or `yes` (case-insensitive).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the flags through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };
        Self {
            local: enabled(LOCAL_MODE_ENV),
            verbose: enabled(VERBOSE_MODE_ENV),
            record: enabled(RECORD_MODE_ENV),
        }
    }
}

/// Engine-wide settings for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Mode flags
    pub mode: ModeFlags,
    /// Capacity of the checkpoint request queue
    pub checkpoint_queue_capacity: usize,
    /// Size above which child results are replaced by a sentinel
    pub large_payload_threshold_bytes: usize,
    /// How long the driver waits for the checkpoint task to exit
    pub shutdown_timeout: StdDuration,
}

impl ExecutionConfig {
    /// Default settings with mode flags taken from the environment.
    pub fn from_env() -> Self {
        Self {
            mode: ModeFlags::from_env(),
            ..Default::default()
        }
    }

    /// Replaces the mode flags.
    pub fn with_mode(mut self, mode: ModeFlags) -> Self {
        self.mode = mode;
        self
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ModeFlags::default(),
            checkpoint_queue_capacity: 100,
            large_payload_threshold_bytes: DEFAULT_LARGE_PAYLOAD_THRESHOLD_BYTES,
            shutdown_timeout: StdDuration::from_secs(5),
        }
    }
}

/// When a step's `Start` checkpoint is written relative to running user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepSemantics {
    /// Await `Start` before running; an interrupted attempt is detectable on replay.
    AtMostOncePerRetry,
    /// Enqueue `Start` without waiting; an interrupted attempt simply runs again.
    #[default]
    AtLeastOncePerRetry,
}

/// Configuration for step operations.
#[derive(Clone, Default)]
pub struct StepConfig {
    /// Retry policy; the default preset applies when unset.
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    /// Start checkpoint timing.
    pub step_semantics: StepSemantics,
}

impl StepConfig {
    /// Sets the retry strategy.
    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    /// Sets the step semantics.
    pub fn with_semantics(mut self, semantics: StepSemantics) -> Self {
        self.step_semantics = semantics;
        self
    }

    pub(crate) fn effective_retry_strategy(&self) -> Arc<dyn RetryStrategy> {
        self.retry_strategy
            .clone()
            .unwrap_or_else(RetryPresets::default_policy)
    }
}

impl std::fmt::Debug for StepConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepConfig")
            .field("retry_strategy", &self.retry_strategy.is_some())
            .field("step_semantics", &self.step_semantics)
            .finish()
    }
}

/// Configuration for child contexts.
///
/// A result larger than the threshold is not stored; replay runs the child
/// closure again to rebuild it, so the closure must be safe to re-run.
#[derive(Debug, Clone, Default)]
pub struct ChildConfig {
    /// Overrides the engine's large-payload threshold for this context.
    pub large_payload_threshold_bytes: Option<usize>,
}

/// Configuration for callback operations.
#[derive(Debug, Clone, Default)]
pub struct CallbackConfig {
    /// Overall timeout; zero means none.
    pub timeout: Duration,
    /// Heartbeat timeout; zero means none.
    pub heartbeat_timeout: Duration,
    /// Config for the submitter step of `wait_for_callback`.
    pub submitter: StepConfig,
}

/// Configuration for bounded fan-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrencyConfig {
    /// Upper bound on items running at once; unbounded when `None`.
    pub max_concurrency: Option<usize>,
}

impl ConcurrencyConfig {
    /// Limits concurrency to `max`.
    pub fn with_max_concurrency(max: usize) -> Self {
        Self {
            max_concurrency: Some(max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_mode_flags_from_lookup() {
        let env: HashMap<&str, &str> = [
            (LOCAL_MODE_ENV, "true"),
            (VERBOSE_MODE_ENV, " 1 "),
            (RECORD_MODE_ENV, "off"),
        ]
        .into_iter()
        .collect();
        let flags = ModeFlags::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert!(flags.local);
        assert!(flags.verbose);
        assert!(!flags.record);
    }

    #[test]
    fn test_mode_flags_default_off() {
        let flags = ModeFlags::from_lookup(|_| None);
        assert_eq!(flags, ModeFlags::default());
    }

    #[test]
    fn test_execution_config_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.large_payload_threshold_bytes, 256 * 1024);
        assert!(config.checkpoint_queue_capacity > 0);
    }

    #[test]
    fn test_step_config_default_semantics() {
        let config = StepConfig::default();
        assert_eq!(config.step_semantics, StepSemantics::AtLeastOncePerRetry);
        assert!(config.retry_strategy.is_none());
    }
}
