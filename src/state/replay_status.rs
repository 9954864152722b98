//! Replay status tracking.

/// Whether the execution is still walking through recorded operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplayStatus {
    /// Some recorded operations have not been visited yet
    Replay = 0,
    /// Every recorded operation has been visited; new work is executing
    New = 1,
}

impl ReplayStatus {
    /// Returns true while replaying.
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay)
    }

    /// Returns true once past the replay point.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

impl From<u8> for ReplayStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Replay,
            _ => Self::New,
        }
    }
}
