//! Lookup result for previously recorded operations.

use crate::error::ErrorObject;
use crate::operation::{Operation, OperationStatus, OperationType};

/// Where a recorded operation stands, from a handler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Nothing recorded for this id
    Absent,
    /// An attempt started and never reached a terminal state
    Started,
    /// A retry is scheduled and not yet due
    Pending,
    /// A retry is scheduled and due
    Ready,
    /// Terminal success
    Succeeded,
    /// Terminal failure (failed, cancelled, timed out or stopped)
    Failed,
}

/// Snapshot of the record stored for one operation id.
#[derive(Debug, Clone, Default)]
pub struct CheckpointedResult {
    operation: Option<Operation>,
}

impl CheckpointedResult {
    /// Wraps a lookup result.
    pub fn new(operation: Option<Operation>) -> Self {
        Self { operation }
    }

    /// Returns true if a record exists.
    pub fn is_existent(&self) -> bool {
        self.operation.is_some()
    }

    /// Classifies the record.
    pub fn state(&self) -> RecordState {
        match self.operation.as_ref().map(|op| op.status) {
            None => RecordState::Absent,
            Some(OperationStatus::Started) => RecordState::Started,
            Some(OperationStatus::Pending) => RecordState::Pending,
            Some(OperationStatus::Ready) => RecordState::Ready,
            Some(OperationStatus::Succeeded) => RecordState::Succeeded,
            Some(
                OperationStatus::Failed
                | OperationStatus::Cancelled
                | OperationStatus::TimedOut
                | OperationStatus::Stopped,
            ) => RecordState::Failed,
        }
    }

    /// Returns the status, if recorded.
    pub fn status(&self) -> Option<OperationStatus> {
        self.operation.as_ref().map(|op| op.status)
    }

    /// Returns the type, if recorded.
    pub fn operation_type(&self) -> Option<OperationType> {
        self.operation.as_ref().map(|op| op.operation_type)
    }

    /// Returns the serialized result.
    pub fn result(&self) -> Option<&str> {
        self.operation.as_ref().and_then(|op| op.result.as_deref())
    }

    /// Returns the recorded error.
    pub fn error(&self) -> Option<&ErrorObject> {
        self.operation.as_ref().and_then(|op| op.error.as_ref())
    }

    /// Returns the backend-recorded attempt count (0 when none).
    pub fn attempt(&self) -> u32 {
        self.operation.as_ref().map(|op| op.attempt()).unwrap_or(0)
    }

    /// Returns the backend-assigned callback id.
    pub fn callback_id(&self) -> Option<&str> {
        self.operation.as_ref().and_then(|op| op.callback_id())
    }

    /// Returns true if the stored result is a sentinel to be rebuilt from children.
    pub fn replays_children(&self) -> bool {
        self.operation
            .as_ref()
            .map(|op| op.replays_children())
            .unwrap_or(false)
    }

    /// Returns the underlying record.
    pub fn operation(&self) -> Option<&Operation> {
        self.operation.as_ref()
    }
}
