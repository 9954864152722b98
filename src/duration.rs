//! Second-granularity durations for waits and callback timeouts.

use serde::{Deserialize, Serialize};

use crate::error::DurableError;

/// A time interval in whole seconds, the unit the backend schedules in.
///
/// ```
/// use durable_execution_engine::Duration;
///
/// assert_eq!(Duration::from_minutes(2).to_seconds(), 120);
/// assert_eq!(Duration::from_days(1).to_seconds(), 86_400);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Duration {
    seconds: u64,
}

impl Duration {
    /// Zero seconds; used as "no timeout" for callbacks.
    pub const ZERO: Duration = Duration { seconds: 0 };

    /// Creates a duration of `seconds` seconds.
    pub fn from_seconds(seconds: u64) -> Self {
        Self { seconds }
    }

    /// Creates a duration of `minutes` minutes.
    pub fn from_minutes(minutes: u64) -> Self {
        Self::from_seconds(minutes.saturating_mul(60))
    }

    /// Creates a duration of `hours` hours.
    pub fn from_hours(hours: u64) -> Self {
        Self::from_seconds(hours.saturating_mul(3_600))
    }

    /// Creates a duration of `days` days.
    pub fn from_days(days: u64) -> Self {
        Self::from_seconds(days.saturating_mul(86_400))
    }

    /// Total seconds.
    pub fn to_seconds(&self) -> u64 {
        self.seconds
    }

    /// True for a zero-length duration.
    pub fn is_zero(&self) -> bool {
        self.seconds == 0
    }

    /// Waits shorter than one second cannot be scheduled.
    pub fn validate_for_wait(&self) -> Result<(), DurableError> {
        if self.seconds == 0 {
            return Err(DurableError::validation(
                "Wait duration must be at least 1 second",
            ));
        }
        Ok(())
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self::from_seconds(duration.as_secs())
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        std::time::Duration::from_secs(duration.seconds)
    }
}
