//! Task records and the patches applied to them
//!
//! A [`Task`] carries the three guarded fields (status, priority,
//! metadata) plus a monotonically increasing version. All mutation flows
//! through [`TaskPatch`] and [`Task::apply_patch`], which is the single
//! place the version is bumped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::id::TaskId;

/// Workflow state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    /// Returns true if the task is finished
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    /// Returns true if the task has not been started
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Todo)
    }

    /// Returns true if the task is being worked on
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::InProgress)
    }

    /// Returns true if the task is waiting on something else
    pub fn is_blocked(&self) -> bool {
        matches!(self, TaskStatus::Blocked)
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }
}

/// Scheduling priority of a task
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Returns true for priorities above the default
    pub fn is_elevated(&self) -> bool {
        *self > TaskPriority::Normal
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

/// Free-form metadata attached to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TaskMeta(HashMap<String, serde_json::Value>);

impl TaskMeta {
    /// Creates an empty metadata map
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `key`, if any
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Stores `value` under `key`, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    /// Removes and returns the value stored under `key`
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    /// Returns true if no keys are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of keys set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over key/value pairs in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Iterates over keys in arbitrary order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Copies every entry of `other` into this map, overwriting on collision
    pub fn merge(&mut self, other: &TaskMeta) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

/// Partial update to a task's guarded fields
///
/// Unset fields leave the current value untouched; metadata entries are
/// merged key-by-key rather than replacing the whole map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "TaskMeta::is_empty")]
    pub metadata: TaskMeta,
}

impl TaskPatch {
    /// Creates an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status to write
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the priority to write
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds one metadata entry to write
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.set(key, value);
        self
    }

    /// Returns true if the patch would change nothing
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.priority.is_none() && self.metadata.is_empty()
    }

    /// Combines two patches, with `later` winning on conflicts
    pub fn merge(mut self, later: &TaskPatch) -> Self {
        if later.status.is_some() {
            self.status = later.status;
        }
        if later.priority.is_some() {
            self.priority = later.priority;
        }
        self.metadata.merge(&later.metadata);
        self
    }
}

/// A shared task record guarded by optimistic concurrency control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "TaskMeta::is_empty")]
    pub metadata: TaskMeta,
    /// Bumped on every applied patch; reads snapshot it, writes compare it
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a fresh task at version 0 with default fields
    pub fn new(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::default(),
            priority: TaskPriority::default(),
            metadata: TaskMeta::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the initial status without bumping the version
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the initial priority without bumping the version
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds an initial metadata entry without bumping the version
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.set(key, value);
        self
    }

    /// Applies a patch in place, bumping the version and update timestamp
    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        self.metadata.merge(&patch.metadata);
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
