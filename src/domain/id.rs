//! Identifiers for task records and in-flight operations
//!
//! Task IDs are caller-supplied opaque strings; this layer never invents
//! them. Operation IDs identify one mutation attempt and are minted from a
//! process-wide counter, so every attempt gets a unique node in the
//! wait-for graph.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("Task ID must not be empty")]
    EmptyTaskId,
}

/// Identifier of a shared task record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task ID from a non-empty string (surrounding whitespace is trimmed)
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(IdError::EmptyTaskId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Sentinel task pinned to elevated priority, used by deadlock resolution
    /// to keep a conflicted task's status gate open
    pub fn system_high_priority() -> Self {
        Self("system-high-priority".to_string())
    }

    /// Returns the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a single in-flight mutation attempt
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    /// Mints the next operation ID from the process-wide counter
    pub fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates an operation ID from a raw value
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}
