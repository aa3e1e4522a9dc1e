//! Versioned task storage
//!
//! The store is the single authority on task versions. [`TaskStore::apply`]
//! performs the compare-and-set: the patch lands only if the caller's read
//! version still matches, otherwise the write is rejected with a
//! [`StoreError::VersionConflict`] and the caller re-reads and retries.

use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::{Task, TaskId, TaskPatch};

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("Version conflict for task {task}: expected {expected}, found {actual}")]
    VersionConflict {
        task: TaskId,
        expected: u64,
        actual: u64,
    },
}

/// Storage backend holding the authoritative task records
pub trait TaskStore: Send + Sync {
    /// Returns a snapshot of the task, including its current version
    fn get(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Applies `patch` if the task is still at `read_version`
    ///
    /// On success the returned task carries the bumped version. The version
    /// check and the write happen under the same lock, so two writers racing
    /// from the same snapshot cannot both land.
    fn apply(&self, id: &TaskId, read_version: u64, patch: &TaskPatch)
        -> Result<Task, StoreError>;
}

/// In-memory store backed by a mutex-protected map
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a task, keeping whatever version it carries
    pub fn insert(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    /// Number of tasks held
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if no tasks are held
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))
    }

    fn apply(
        &self,
        id: &TaskId,
        read_version: u64,
        patch: &TaskPatch,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;

        if task.version != read_version {
            return Err(StoreError::VersionConflict {
                task: id.clone(),
                expected: read_version,
                actual: task.version,
            });
        }

        task.apply_patch(patch);
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskPriority, TaskStatus};

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[test]
    fn get_missing_task_fails() {
        let store = MemoryTaskStore::new();
        assert_eq!(
            store.get(&tid("nope")),
            Err(StoreError::TaskNotFound(tid("nope")))
        );
    }

    #[test]
    fn insert_then_get() {
        let store = MemoryTaskStore::new();
        store.insert(Task::new(tid("task-1")));

        let task = store.get(&tid("task-1")).unwrap();
        assert_eq!(task.id, tid("task-1"));
        assert_eq!(task.version, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn apply_at_matching_version_lands() {
        let store = MemoryTaskStore::new();
        store.insert(Task::new(tid("task-1")));

        let patch = TaskPatch::new().with_status(TaskStatus::InProgress);
        let updated = store.apply(&tid("task-1"), 0, &patch).unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert_eq!(store.get(&tid("task-1")).unwrap().version, 1);
    }

    #[test]
    fn apply_at_stale_version_conflicts() {
        let store = MemoryTaskStore::new();
        store.insert(Task::new(tid("task-1")));

        let patch = TaskPatch::new().with_priority(TaskPriority::High);
        store.apply(&tid("task-1"), 0, &patch).unwrap();

        let err = store.apply(&tid("task-1"), 0, &patch).unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                task: tid("task-1"),
                expected: 0,
                actual: 1,
            }
        );
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn apply_to_missing_task_fails() {
        let store = MemoryTaskStore::new();
        let patch = TaskPatch::new().with_status(TaskStatus::Done);
        assert_eq!(
            store.apply(&tid("ghost"), 0, &patch),
            Err(StoreError::TaskNotFound(tid("ghost")))
        );
    }

    #[test]
    fn racing_writers_from_same_snapshot_one_wins() {
        let store = MemoryTaskStore::new();
        store.insert(Task::new(tid("task-1")));

        let a = TaskPatch::new().with_status(TaskStatus::InProgress);
        let b = TaskPatch::new().with_status(TaskStatus::Done);

        let first = store.apply(&tid("task-1"), 0, &a);
        let second = store.apply(&tid("task-1"), 0, &b);

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(StoreError::VersionConflict { actual: 1, .. })
        ));
        assert_eq!(store.get(&tid("task-1")).unwrap().status, TaskStatus::InProgress);
    }
}
