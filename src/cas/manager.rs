//! Compare-and-set execution with deadlock-aware retry
//!
//! [`CasManager`] drives every mutation: read a snapshot, run the caller's
//! update function against it, and apply the resulting patch only if the
//! version is unchanged. Transient failures (version conflicts, lock
//! contention, timeouts) are retried with exponential backoff; permanent
//! ones surface immediately. Before each attempt the lock-level deadlock
//! detector runs, and an operation chosen as victim is re-minted under a
//! fresh ID so the abort cannot wedge it forever.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cas::retry::{is_transient, RetryPolicy};
use crate::config::TasklockConfig;
use crate::detect::{
    DependencyError, PriorityStatusDetector, ResourceType, SemanticReport,
};
use crate::domain::{
    DependencyRef, OperationId, PriorityStatusDependency, Task, TaskId, TaskPatch,
};
use crate::store::{StoreError, TaskStore};

/// Computes the patch to apply, given the current task snapshot
pub type UpdateFn = Arc<dyn Fn(&Task) -> anyhow::Result<TaskPatch> + Send + Sync>;

#[derive(Debug, Error)]
pub enum CasError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Update rejected for task {task}: {reason:#}")]
    UpdateRejected { task: TaskId, reason: anyhow::Error },
    #[error("CAS for task {task} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task: TaskId,
        attempts: u32,
        last_error: String,
    },
    #[error("No resource updates supplied for task {0}")]
    NoResourceUpdates(TaskId),
    #[error("Manager is closed")]
    Closed,
}

/// An update scoped to one lockable resource of the task
#[derive(Clone)]
pub struct ResourceUpdate {
    pub resource: ResourceType,
    pub update: UpdateFn,
}

impl ResourceUpdate {
    pub fn new(resource: ResourceType, update: UpdateFn) -> Self {
        Self { resource, update }
    }
}

impl fmt::Debug for ResourceUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceUpdate")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum Payload {
    Single(UpdateFn),
    MultiResource(Vec<ResourceUpdate>),
}

/// One in-flight mutation attempt
#[derive(Clone)]
pub struct CasOperation {
    pub id: OperationId,
    pub task_id: TaskId,
    /// Version the caller read, if it wants a strict check before updating
    pub expected_version: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    payload: Payload,
}

impl CasOperation {
    fn new(
        task_id: TaskId,
        expected_version: Option<u64>,
        timeout: Duration,
        max_retries: u32,
        payload: Payload,
    ) -> Self {
        Self {
            id: OperationId::next(),
            task_id,
            expected_version,
            created_at: Utc::now(),
            timeout,
            retry_count: 0,
            max_retries,
            payload,
        }
    }

    /// Returns true if this operation locks individual resources
    pub fn is_multi_resource(&self) -> bool {
        matches!(self.payload, Payload::MultiResource(_))
    }
}

impl fmt::Debug for CasOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasOperation")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("expected_version", &self.expected_version)
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("multi_resource", &self.is_multi_resource())
            .finish_non_exhaustive()
    }
}

/// Result of a successful compare-and-set
#[derive(Debug, Clone)]
pub struct CasOutcome {
    /// Task as written, carrying the bumped version
    pub task: Task,
    /// ID the operation completed under (re-minted after a victim abort)
    pub operation_id: OperationId,
    pub attempts: u32,
}

/// Point-in-time counters over the locking subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CasStats {
    pub active_locks: usize,
    pub wait_graph_edges: usize,
    pub pending_operations: usize,
}

/// Orchestrates optimistic updates to shared task records
pub struct CasManager {
    store: Arc<dyn TaskStore>,
    detector: PriorityStatusDetector,
    policy: RetryPolicy,
    pending: Mutex<HashMap<OperationId, CasOperation>>,
    lock_timeout: Duration,
    default_max_retries: u32,
    closed: AtomicBool,
}

impl CasManager {
    /// Creates a manager with default configuration
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_config(store, &TasklockConfig::default())
    }

    /// Creates a manager using the given configuration
    pub fn with_config(store: Arc<dyn TaskStore>, config: &TasklockConfig) -> Self {
        Self {
            store,
            detector: PriorityStatusDetector::with_config(config),
            policy: RetryPolicy::from_config(&config.retry),
            pending: Mutex::new(HashMap::new()),
            lock_timeout: config.lock.timeout(),
            default_max_retries: config.retry.max_retries,
            closed: AtomicBool::new(false),
        }
    }

    /// The layered deadlock detector backing this manager
    pub fn detector(&self) -> &PriorityStatusDetector {
        &self.detector
    }

    /// Executes a single-field compare-and-set with default retries
    pub fn execute_cas(
        &self,
        task_id: TaskId,
        expected_version: Option<u64>,
        update: UpdateFn,
    ) -> Result<CasOutcome, CasError> {
        self.execute_cas_with(task_id, expected_version, update, self.default_max_retries)
    }

    /// Executes a single-field compare-and-set with an explicit retry budget
    pub fn execute_cas_with(
        &self,
        task_id: TaskId,
        expected_version: Option<u64>,
        update: UpdateFn,
        max_retries: u32,
    ) -> Result<CasOutcome, CasError> {
        let op = CasOperation::new(
            task_id,
            expected_version,
            self.lock_timeout,
            max_retries,
            Payload::Single(update),
        );
        self.run(op)
    }

    /// Executes an update spanning several resources of one task
    ///
    /// Locks every named resource (in a fixed global order, so two
    /// multi-resource operations cannot deadlock each other), runs all
    /// update functions against one snapshot, and applies the merged patch
    /// as a single version bump.
    pub fn execute_multi_resource_cas(
        &self,
        task_id: TaskId,
        expected_version: Option<u64>,
        updates: Vec<ResourceUpdate>,
    ) -> Result<CasOutcome, CasError> {
        self.execute_multi_resource_cas_with(
            task_id,
            expected_version,
            updates,
            self.default_max_retries,
        )
    }

    /// Multi-resource variant with an explicit retry budget
    pub fn execute_multi_resource_cas_with(
        &self,
        task_id: TaskId,
        expected_version: Option<u64>,
        updates: Vec<ResourceUpdate>,
        max_retries: u32,
    ) -> Result<CasOutcome, CasError> {
        if updates.is_empty() {
            return Err(CasError::NoResourceUpdates(task_id));
        }
        let op = CasOperation::new(
            task_id,
            expected_version,
            self.lock_timeout,
            max_retries,
            Payload::MultiResource(updates),
        );
        self.run(op)
    }

    /// Registers a semantic priority/status dependency
    pub fn add_priority_status_dependency(
        &self,
        dep: PriorityStatusDependency,
    ) -> Result<(), DependencyError> {
        self.detector.add_dependency(dep)
    }

    /// Counts over the semantic dependency graph
    pub fn priority_status_stats(&self) -> crate::detect::SemanticStats {
        self.detector.stats()
    }

    /// Runs the layered detection pass (lock-level plus semantic)
    pub fn detect_deadlocks(&self) -> SemanticReport {
        self.detector.detect()
    }

    /// Applies a semantic report's resolution, returning removed edges
    pub fn resolve_deadlocks(&self, report: &SemanticReport) -> Vec<DependencyRef> {
        self.detector.resolve(report)
    }

    /// Counters over locks, wait edges, and in-flight operations
    pub fn deadlock_stats(&self) -> CasStats {
        CasStats {
            active_locks: self.detector.base().active_locks(),
            wait_graph_edges: self.detector.base().wait_edges(),
            pending_operations: self.pending.lock().len(),
        }
    }

    /// Snapshot of in-flight operations, ordered by ID
    pub fn pending_operations(&self) -> Vec<CasOperation> {
        let pending = self.pending.lock();
        let mut ops: Vec<CasOperation> = pending.values().cloned().collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Shuts down: clears pending operations and closes the detector
    ///
    /// Safe to call more than once; subsequent executions fail with
    /// [`CasError::Closed`].
    pub fn cleanup(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pending.lock().clear();
            self.detector.close();
            info!("cas manager closed");
        }
    }

    fn run(&self, mut op: CasOperation) -> Result<CasOutcome, CasError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CasError::Closed);
        }
        self.pending.lock().insert(op.id, op.clone());
        let result = self.drive(&mut op);
        self.pending.lock().remove(&op.id);
        result
    }

    fn drive(&self, op: &mut CasOperation) -> Result<CasOutcome, CasError> {
        let mut attempts = 0u32;
        loop {
            let report = self.detector.base().detect_deadlock();
            let victim_is_self = report.deadlocked && report.victim == Some(op.id);
            if report.deadlocked {
                self.detector.base().resolve_deadlock(&report);
            }
            if victim_is_self || self.detector.base().is_aborted(op.id) {
                warn!(op = %op.id, task = %op.task_id, "operation aborted as deadlock victim");
                op.retry_count += 1;
                if op.retry_count > op.max_retries {
                    return Err(CasError::RetriesExhausted {
                        task: op.task_id.clone(),
                        attempts,
                        last_error: "operation repeatedly aborted as deadlock victim"
                            .to_string(),
                    });
                }
                self.reissue(op);
                thread::sleep(self.policy.delay_for(op.retry_count));
                continue;
            }

            attempts += 1;
            match self.attempt(op) {
                Ok(task) => {
                    debug!(op = %op.id, task = %op.task_id, version = task.version, attempts, "cas applied");
                    return Ok(CasOutcome {
                        task,
                        operation_id: op.id,
                        attempts,
                    });
                }
                Err(err) => {
                    if !is_transient(&err) {
                        return Err(self.terminal_error(op, err));
                    }
                    op.retry_count += 1;
                    if op.retry_count > op.max_retries {
                        warn!(op = %op.id, task = %op.task_id, attempts, "retries exhausted");
                        return Err(CasError::RetriesExhausted {
                            task: op.task_id.clone(),
                            attempts,
                            last_error: format!("{err:#}"),
                        });
                    }
                    debug!(op = %op.id, retry = op.retry_count, "transient failure, backing off");
                    thread::sleep(self.policy.delay_for(op.retry_count));
                }
            }
        }
    }

    // An aborted ID can never lock again, so the retry continues under a
    // fresh one.
    fn reissue(&self, op: &mut CasOperation) {
        let mut pending = self.pending.lock();
        pending.remove(&op.id);
        let old = op.id;
        op.id = OperationId::next();
        pending.insert(op.id, op.clone());
        debug!(old = %old, new = %op.id, "operation reissued after abort");
    }

    fn attempt(&self, op: &CasOperation) -> anyhow::Result<Task> {
        match &op.payload {
            Payload::Single(update) => self.attempt_single(op, update),
            Payload::MultiResource(updates) => self.attempt_multi(op, updates),
        }
    }

    fn attempt_single(&self, op: &CasOperation, update: &UpdateFn) -> anyhow::Result<Task> {
        let current = self.store.get(&op.task_id)?;
        self.check_expected_version(op, &current)?;
        let patch = update(&current)
            .with_context(|| format!("Update function failed for task {}", op.task_id))?;
        Ok(self.store.apply(&op.task_id, current.version, &patch)?)
    }

    fn attempt_multi(
        &self,
        op: &CasOperation,
        updates: &[ResourceUpdate],
    ) -> anyhow::Result<Task> {
        let mut resources: Vec<ResourceType> = updates.iter().map(|u| u.resource).collect();
        resources.sort();
        resources.dedup();

        let _session = LockSession::acquire(
            &self.detector,
            op.id,
            &op.task_id,
            &resources,
            op.timeout,
        )?;

        let current = self.store.get(&op.task_id)?;
        self.check_expected_version(op, &current)?;

        let mut patch = TaskPatch::new();
        for update in updates {
            let next = (update.update)(&current).with_context(|| {
                format!(
                    "Update for {} of task {} failed",
                    update.resource, op.task_id
                )
            })?;
            patch = patch.merge(&next);
        }
        Ok(self.store.apply(&op.task_id, current.version, &patch)?)
    }

    fn check_expected_version(&self, op: &CasOperation, current: &Task) -> anyhow::Result<()> {
        if let Some(expected) = op.expected_version {
            if current.version != expected {
                return Err(StoreError::VersionConflict {
                    task: op.task_id.clone(),
                    expected,
                    actual: current.version,
                }
                .into());
            }
        }
        Ok(())
    }

    fn terminal_error(&self, op: &CasOperation, err: anyhow::Error) -> CasError {
        match err.downcast::<StoreError>() {
            Ok(store_err) => CasError::Store(store_err),
            Err(err) => CasError::UpdateRejected {
                task: op.task_id.clone(),
                reason: err,
            },
        }
    }
}

impl Drop for CasManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Holds per-resource locks for the duration of one attempt
///
/// Dropping the session releases whatever was acquired, including after a
/// partial acquisition failure.
struct LockSession<'a> {
    detector: &'a PriorityStatusDetector,
    op: OperationId,
    task: TaskId,
    held: Vec<ResourceType>,
}

impl<'a> LockSession<'a> {
    fn acquire(
        detector: &'a PriorityStatusDetector,
        op: OperationId,
        task: &TaskId,
        resources: &[ResourceType],
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut session = Self {
            detector,
            op,
            task: task.clone(),
            held: Vec::new(),
        };
        for &resource in resources {
            if !detector.base().acquire_lock(op, task, resource, timeout) {
                return Err(anyhow!("lock conflict on {resource} of task {task}"));
            }
            session.held.push(resource);
        }
        Ok(session)
    }
}

impl Drop for LockSession<'_> {
    fn drop(&mut self) {
        for &resource in &self.held {
            self.detector.base().release_lock(self.op, &self.task, resource);
        }
    }
}
