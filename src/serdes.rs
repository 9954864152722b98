//! Serialization of checkpointed values.
//!
//! Every value that crosses a checkpoint goes through a [`SerDes`]. Handlers
//! use [`JsonSerDes`]; a success value is always returned by deserializing the
//! exact payload that was checkpointed, so first runs and replays observe the
//! same value.

use std::fmt;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::error::DurableError;

/// Which direction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerDesErrorKind {
    /// Value to payload
    Serialization,
    /// Payload to value
    Deserialization,
}

/// A serialization failure for one operation.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} failed for operation {operation_id}: {message}")]
pub struct SerDesError {
    /// Which direction failed
    pub kind: SerDesErrorKind,
    /// Operation the value belonged to
    pub operation_id: String,
    /// Underlying error text
    pub message: String,
}

impl From<SerDesError> for DurableError {
    fn from(error: SerDesError) -> Self {
        DurableError::serdes(error.to_string())
    }
}

/// Where a value is being (de)serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerDesContext {
    /// The operation the value belongs to
    pub operation_id: String,
    /// The execution the operation belongs to
    pub execution_id: String,
}

impl SerDesContext {
    /// Creates a new context.
    pub fn new(operation_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            execution_id: execution_id.into(),
        }
    }
}

/// Converts values to and from checkpoint payloads.
pub trait SerDes<T>: Send + Sync {
    /// Encodes a value.
    fn serialize(&self, value: &T, context: &SerDesContext) -> Result<String, SerDesError>;

    /// Decodes a payload.
    fn deserialize(&self, payload: &str, context: &SerDesContext) -> Result<T, SerDesError>;
}

/// JSON payloads via `serde_json`.
pub struct JsonSerDes<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerDes<T> {
    /// Creates a new JSON serdes.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerDes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerDes<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonSerDes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonSerDes")
    }
}

impl<T> SerDes<T> for JsonSerDes<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, context: &SerDesContext) -> Result<String, SerDesError> {
        serde_json::to_string(value).map_err(|e| SerDesError {
            kind: SerDesErrorKind::Serialization,
            operation_id: context.operation_id.clone(),
            message: e.to_string(),
        })
    }

    fn deserialize(&self, payload: &str, context: &SerDesContext) -> Result<T, SerDesError> {
        serde_json::from_str(payload).map_err(|e| SerDesError {
            kind: SerDesErrorKind::Deserialization,
            operation_id: context.operation_id.clone(),
            message: e.to_string(),
        })
    }
}
