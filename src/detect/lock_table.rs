//! Per-resource lock table with deadline tracking
//!
//! Each task exposes three lockable resources (metadata, priority, status).
//! A lock is held by exactly one operation and carries a deadline after
//! which the reaper may force-release it. Expiry is tracked in a min-heap
//! keyed by deadline; released locks leave stale heap entries behind, which
//! are skipped lazily by comparing grant sequence numbers.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use crate::domain::{OperationId, TaskId};

/// Lockable field of a task record
///
/// Multi-resource acquisition sorts by this ordering to keep lock order
/// consistent across operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Metadata,
    Priority,
    Status,
}

impl ResourceType {
    /// All resource types in acquisition order
    pub const ALL: [ResourceType; 3] = [
        ResourceType::Metadata,
        ResourceType::Priority,
        ResourceType::Status,
    ];

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            ResourceType::Metadata => "metadata",
            ResourceType::Priority => "priority",
            ResourceType::Status => "status",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One granted lock on a task resource
#[derive(Debug, Clone)]
pub struct ResourceLock {
    pub task_id: TaskId,
    pub operation_id: OperationId,
    pub resource: ResourceType,
    pub acquired_at: Instant,
    pub timeout: Duration,
    /// Distinguishes this grant from earlier grants of the same slot
    pub grant_seq: u64,
}

impl ResourceLock {
    /// Moment after which the lock is considered abandoned
    pub fn deadline(&self) -> Instant {
        self.acquired_at + self.timeout
    }

    /// Returns true if the lock's deadline has passed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

/// Heap entry ordering expirations by deadline
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryEntry {
    deadline: Instant,
    grant_seq: u64,
    task_id: TaskId,
    resource: ResourceType,
}

/// Tracks which operation holds which task resource
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    locks: HashMap<(TaskId, ResourceType), ResourceLock>,
    expiry: BinaryHeap<Reverse<ExpiryEntry>>,
    next_grant_seq: u64,
}

impl ResourceLockTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation currently holding `resource` of `task`, if any
    pub fn holder(&self, task: &TaskId, resource: ResourceType) -> Option<OperationId> {
        self.locks
            .get(&(task.clone(), resource))
            .map(|lock| lock.operation_id)
    }

    /// Grants the lock to `op` if the slot is free
    ///
    /// Returns false without side effects when another operation holds it.
    pub fn grant(
        &mut self,
        task: TaskId,
        resource: ResourceType,
        op: OperationId,
        timeout: Duration,
    ) -> bool {
        let key = (task.clone(), resource);
        if self.locks.contains_key(&key) {
            return false;
        }

        let grant_seq = self.next_grant_seq;
        self.next_grant_seq += 1;

        let lock = ResourceLock {
            task_id: task.clone(),
            operation_id: op,
            resource,
            acquired_at: Instant::now(),
            timeout,
            grant_seq,
        };
        self.expiry.push(Reverse(ExpiryEntry {
            deadline: lock.deadline(),
            grant_seq,
            task_id: task,
            resource,
        }));
        self.locks.insert(key, lock);
        true
    }

    /// Releases the lock if `op` is the holder
    pub fn release(&mut self, task: &TaskId, resource: ResourceType, op: OperationId) -> bool {
        let key = (task.clone(), resource);
        match self.locks.get(&key) {
            Some(lock) if lock.operation_id == op => {
                self.locks.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Releases every lock held by `op`, returning the freed slots
    pub fn release_all_held_by(&mut self, op: OperationId) -> Vec<(TaskId, ResourceType)> {
        let freed: Vec<(TaskId, ResourceType)> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.operation_id == op)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &freed {
            self.locks.remove(key);
        }
        freed
    }

    /// Distinct tasks on which `op` holds at least one resource
    pub fn tasks_held_by(&self, op: OperationId) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self
            .locks
            .values()
            .filter(|lock| lock.operation_id == op)
            .map(|lock| lock.task_id.clone())
            .collect();
        tasks.sort();
        tasks.dedup();
        tasks
    }

    /// Returns true if the operation holds any lock past its deadline
    pub fn holds_expired_lock(&self, op: OperationId, now: Instant) -> bool {
        self.locks
            .values()
            .any(|lock| lock.operation_id == op && lock.is_expired(now))
    }

    /// Earliest deadline among live locks, discarding stale heap entries
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.expiry.peek() {
            if self.is_live(entry) {
                return Some(entry.deadline);
            }
            self.expiry.pop();
        }
        None
    }

    /// Removes and returns every lock whose deadline has passed at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Vec<ResourceLock> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.expiry.peek() {
            if !self.is_live(entry) {
                self.expiry.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.expiry.pop() else {
                break;
            };
            if let Some(lock) = self.locks.remove(&(entry.task_id, entry.resource)) {
                expired.push(lock);
            }
        }
        expired
    }

    /// Number of live locks
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no locks are held
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drops all locks and pending expirations
    pub fn clear(&mut self) {
        self.locks.clear();
        self.expiry.clear();
    }

    fn is_live(&self, entry: &ExpiryEntry) -> bool {
        self.locks
            .get(&(entry.task_id.clone(), entry.resource))
            .is_some_and(|lock| lock.grant_seq == entry.grant_seq)
    }
}
