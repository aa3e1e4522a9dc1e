//! Lock acquisition with deadlock detection and expiry
//!
//! The detector owns the lock table and wait-for graph behind one mutex.
//! Blocked acquirers park on a condvar and are woken by releases, aborts,
//! or the reaper. A background reaper thread sleeps until the earliest
//! lock deadline and force-releases locks that outlive their timeout, so
//! a crashed holder cannot wedge its waiters forever.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::detect::lock_table::{ResourceLockTable, ResourceType};
use crate::detect::wait_graph::WaitForGraph;
use crate::domain::{OperationId, TaskId};

/// How a deadlock report was (or would be) resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockResolution {
    Timeout,
    VictimSelection,
    WaitForGraph,
}

/// Result of one deadlock detection pass over the wait-for graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockReport {
    pub deadlocked: bool,
    pub cycle: Vec<OperationId>,
    pub victim: Option<OperationId>,
    pub strategy: LockResolution,
}

struct DetectorState {
    locks: ResourceLockTable,
    waits: WaitForGraph,
    /// Victims of an abort; they may never lock again under the same ID
    aborted: BTreeSet<OperationId>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<DetectorState>,
    /// Signalled whenever a lock slot frees up
    lock_released: Condvar,
    /// Signalled whenever the earliest deadline may have moved
    expiry_changed: Condvar,
}

/// Deadlock-aware resource lock manager
pub struct DeadlockDetector {
    shared: Arc<Shared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    max_wait: Duration,
}

impl DeadlockDetector {
    /// Creates a detector with default lock configuration
    pub fn new() -> Self {
        Self::with_config(&LockConfig::default())
    }

    /// Creates a detector and starts its reaper thread
    pub fn with_config(config: &LockConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(DetectorState {
                locks: ResourceLockTable::new(),
                waits: WaitForGraph::new(),
                aborted: BTreeSet::new(),
                shutdown: false,
            }),
            lock_released: Condvar::new(),
            expiry_changed: Condvar::new(),
        });

        let reaper_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || reaper_loop(&reaper_shared));

        Self {
            shared,
            reaper: Mutex::new(Some(handle)),
            max_wait: config.max_wait(),
        }
    }

    /// Tries to lock `resource` of `task` for `op`, waiting briefly if busy
    ///
    /// The wait is bounded by `min(max_wait, timeout / 4)` so a waiter never
    /// outsleeps the holder's own lifetime by much. Returns false when the
    /// wait window closes, the operation was aborted, or waiting would
    /// immediately deadlock (the holder is already blocked on `op`).
    pub fn acquire_lock(
        &self,
        op: OperationId,
        task: &TaskId,
        resource: ResourceType,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + self.max_wait.min(timeout / 4);
        let mut state = self.shared.state.lock();

        if state.shutdown || state.aborted.contains(&op) {
            return false;
        }

        let holder = match state.locks.holder(task, resource) {
            None => {
                state.locks.grant(task.clone(), resource, op, timeout);
                self.shared.expiry_changed.notify_all();
                return true;
            }
            Some(holder) if holder == op => return true,
            Some(holder) => holder,
        };

        if state.waits.waits_on(holder, op) {
            warn!(
                op = %op,
                holder = %holder,
                task = %task,
                resource = %resource,
                "holder already waits on requester, refusing to wait"
            );
            return false;
        }

        state.waits.add_edge(op, holder);
        let granted = loop {
            if state.aborted.contains(&op) || state.shutdown {
                break false;
            }
            match state.locks.holder(task, resource) {
                None => {
                    state.locks.grant(task.clone(), resource, op, timeout);
                    self.shared.expiry_changed.notify_all();
                    break true;
                }
                Some(current) if current == op => break true,
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                break false;
            }
            let _ = self.shared.lock_released.wait_until(&mut state, deadline);
        };
        state.waits.remove_edge(op, holder);

        if !granted {
            debug!(op = %op, task = %task, resource = %resource, "lock wait window closed");
        }
        granted
    }

    /// Releases `resource` of `task` if `op` holds it
    ///
    /// The operation's outgoing wait edges are dropped regardless, since a
    /// releasing operation is by definition no longer parked.
    pub fn release_lock(&self, op: OperationId, task: &TaskId, resource: ResourceType) -> bool {
        let mut state = self.shared.state.lock();
        let released = state.locks.release(task, resource, op);
        state.waits.remove_outgoing(op);
        if released {
            self.shared.lock_released.notify_all();
            debug!(op = %op, task = %task, resource = %resource, "lock released");
        }
        released
    }

    /// Scans the wait-for graph for a deadlock cycle
    pub fn detect_deadlock(&self) -> DeadlockReport {
        let state = self.shared.state.lock();
        match state.waits.find_cycle() {
            Some(cycle) => {
                // A cycle held open by an already-expired lock needs no
                // victim; the reaper will break it when it fires.
                let now = Instant::now();
                if cycle
                    .path
                    .iter()
                    .any(|op| state.locks.holds_expired_lock(*op, now))
                {
                    warn!(
                        cycle_len = cycle.path.len(),
                        "deadlock cycle contains an expired lock, deferring to expiry"
                    );
                    return DeadlockReport {
                        deadlocked: true,
                        cycle: cycle.path,
                        victim: None,
                        strategy: LockResolution::Timeout,
                    };
                }
                warn!(
                    victim = %cycle.victim,
                    cycle_len = cycle.path.len(),
                    "deadlock cycle detected"
                );
                DeadlockReport {
                    deadlocked: true,
                    cycle: cycle.path,
                    victim: Some(cycle.victim),
                    strategy: LockResolution::VictimSelection,
                }
            }
            None => DeadlockReport {
                deadlocked: false,
                cycle: Vec::new(),
                victim: None,
                strategy: LockResolution::WaitForGraph,
            },
        }
    }

    /// Aborts the report's victim, returning the lock slots that freed up
    pub fn resolve_deadlock(&self, report: &DeadlockReport) -> Vec<(TaskId, ResourceType)> {
        match report.victim {
            Some(victim) if report.deadlocked => self.abort_operation(victim),
            _ => Vec::new(),
        }
    }

    /// Force-releases everything `op` holds and bans it from future locking
    pub fn abort_operation(&self, op: OperationId) -> Vec<(TaskId, ResourceType)> {
        let mut state = self.shared.state.lock();
        let freed = state.locks.release_all_held_by(op);
        state.waits.remove_operation(op);
        state.aborted.insert(op);
        self.shared.lock_released.notify_all();
        info!(op = %op, freed = freed.len(), "operation aborted");
        freed
    }

    /// Returns true if `op` has been aborted
    pub fn is_aborted(&self, op: OperationId) -> bool {
        self.shared.state.lock().aborted.contains(&op)
    }

    /// Distinct tasks on which `op` currently holds locks
    pub fn tasks_held_by(&self, op: OperationId) -> Vec<TaskId> {
        self.shared.state.lock().locks.tasks_held_by(op)
    }

    /// Number of currently held locks
    pub fn active_locks(&self) -> usize {
        self.shared.state.lock().locks.len()
    }

    /// Number of edges in the wait-for graph
    pub fn wait_edges(&self) -> usize {
        self.shared.state.lock().waits.edge_count()
    }

    /// Shuts down: drops all state, wakes all waiters, joins the reaper
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.locks.clear();
            state.waits.clear();
            state.aborted.clear();
        }
        self.shared.lock_released.notify_all();
        self.shared.expiry_changed.notify_all();
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
        debug!("deadlock detector closed");
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.close();
    }
}

fn reaper_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        match state.locks.next_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    let expired = state.locks.pop_expired(now);
                    for lock in &expired {
                        warn!(
                            op = %lock.operation_id,
                            task = %lock.task_id,
                            resource = %lock.resource,
                            "lock expired, force-releasing"
                        );
                    }
                    if !expired.is_empty() {
                        shared.lock_released.notify_all();
                    }
                } else {
                    let _ = shared.expiry_changed.wait_until(&mut state, deadline);
                }
            }
            None => shared.expiry_changed.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn op(n: u64) -> OperationId {
        OperationId::from_u64(n)
    }

    fn detector(timeout_ms: u64, max_wait_ms: u64) -> DeadlockDetector {
        DeadlockDetector::with_config(&LockConfig {
            timeout_ms,
            max_wait_ms,
        })
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn acquire_free_lock() {
        let det = detector(5000, 1000);
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));
        assert_eq!(det.active_locks(), 1);
        assert_eq!(det.tasks_held_by(op(1)), vec![tid("t1")]);
        det.close();
    }

    #[test]
    fn reacquire_by_holder_is_noop() {
        let det = detector(5000, 1000);
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));
        assert_eq!(det.active_locks(), 1);
        det.close();
    }

    #[test]
    fn busy_lock_times_out_quickly() {
        let det = detector(5000, 40);
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));

        let started = Instant::now();
        assert!(!det.acquire_lock(op(2), &tid("t1"), ResourceType::Status, TIMEOUT));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(det.wait_edges(), 0);
        det.close();
    }

    #[test]
    fn wait_window_is_quarter_of_short_timeouts() {
        let det = detector(5000, 1000);
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));

        // 200ms lock timeout caps the wait at 50ms, well below max_wait
        let started = Instant::now();
        let short = Duration::from_millis(200);
        assert!(!det.acquire_lock(op(2), &tid("t1"), ResourceType::Status, short));
        assert!(started.elapsed() < Duration::from_millis(500));
        det.close();
    }

    #[test]
    fn release_hands_lock_to_waiter() {
        let det = Arc::new(detector(5000, 1000));
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));

        let waiter = {
            let det = Arc::clone(&det);
            thread::spawn(move || det.acquire_lock(op(2), &tid("t1"), ResourceType::Status, TIMEOUT))
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(det.wait_edges(), 1);
        assert!(det.release_lock(op(1), &tid("t1"), ResourceType::Status));

        assert!(waiter.join().unwrap());
        assert_eq!(det.active_locks(), 1);
        assert_eq!(det.tasks_held_by(op(2)), vec![tid("t1")]);
        det.close();
    }

    #[test]
    fn release_by_non_holder_fails() {
        let det = detector(5000, 1000);
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));
        assert!(!det.release_lock(op(2), &tid("t1"), ResourceType::Status));
        assert_eq!(det.active_locks(), 1);
        det.close();
    }

    #[test]
    fn immediate_deadlock_fails_fast() {
        let det = Arc::new(detector(5000, 2000));
        assert!(det.acquire_lock(op(1), &tid("a"), ResourceType::Status, TIMEOUT));

        // op2 takes b.status, then blocks on a.status held by op1
        let blocked = {
            let det = Arc::clone(&det);
            thread::spawn(move || {
                assert!(det.acquire_lock(op(2), &tid("b"), ResourceType::Status, TIMEOUT));
                det.acquire_lock(op(2), &tid("a"), ResourceType::Status, TIMEOUT)
            })
        };
        thread::sleep(Duration::from_millis(100));

        // op1 asking for b.status would close a two-cycle; refuse instantly
        let started = Instant::now();
        assert!(!det.acquire_lock(op(1), &tid("b"), ResourceType::Status, TIMEOUT));
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(det.release_lock(op(1), &tid("a"), ResourceType::Status));
        assert!(blocked.join().unwrap());
        det.close();
    }

    #[test]
    fn abort_frees_locks_and_bans_operation() {
        let det = detector(5000, 1000);
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));
        assert!(det.acquire_lock(op(1), &tid("t2"), ResourceType::Priority, TIMEOUT));

        let mut freed = det.abort_operation(op(1));
        freed.sort();
        assert_eq!(
            freed,
            vec![
                (tid("t1"), ResourceType::Status),
                (tid("t2"), ResourceType::Priority),
            ]
        );
        assert_eq!(det.active_locks(), 0);
        assert!(det.is_aborted(op(1)));
        assert!(!det.acquire_lock(op(1), &tid("t3"), ResourceType::Status, TIMEOUT));
        det.close();
    }

    #[test]
    fn three_way_cycle_is_detected_and_resolved() {
        let det = Arc::new(detector(5000, 2000));
        assert!(det.acquire_lock(op(1), &tid("a"), ResourceType::Status, TIMEOUT));
        assert!(det.acquire_lock(op(2), &tid("b"), ResourceType::Status, TIMEOUT));
        assert!(det.acquire_lock(op(3), &tid("c"), ResourceType::Status, TIMEOUT));

        // Each thread wants the next task's lock; on success it releases
        // both what it got and what it already held, unwinding the chain.
        let spawn_waiter = |o: OperationId, held: &str, wanted: &str| {
            let det = Arc::clone(&det);
            let held = tid(held);
            let wanted = tid(wanted);
            thread::spawn(move || {
                let got = det.acquire_lock(o, &wanted, ResourceType::Status, TIMEOUT);
                if got {
                    det.release_lock(o, &wanted, ResourceType::Status);
                    det.release_lock(o, &held, ResourceType::Status);
                }
                got
            })
        };

        let t1 = spawn_waiter(op(1), "a", "b");
        thread::sleep(Duration::from_millis(50));
        let t2 = spawn_waiter(op(2), "b", "c");
        thread::sleep(Duration::from_millis(50));
        let t3 = spawn_waiter(op(3), "c", "a");
        thread::sleep(Duration::from_millis(100));

        let report = det.detect_deadlock();
        assert!(report.deadlocked);
        assert_eq!(report.cycle, vec![op(1), op(2), op(3)]);
        assert_eq!(report.victim, Some(op(3)));
        assert_eq!(report.strategy, LockResolution::VictimSelection);

        let freed = det.resolve_deadlock(&report);
        assert_eq!(freed, vec![(tid("c"), ResourceType::Status)]);

        // Victim lost its wait; survivors unwind in order
        assert!(!t3.join().unwrap());
        assert!(t2.join().unwrap());
        assert!(t1.join().unwrap());
        det.close();
    }

    #[test]
    fn detect_without_cycle_reports_clean() {
        let det = detector(5000, 1000);
        let report = det.detect_deadlock();
        assert!(!report.deadlocked);
        assert!(report.cycle.is_empty());
        assert_eq!(report.victim, None);
        assert_eq!(report.strategy, LockResolution::WaitForGraph);
        assert!(det.resolve_deadlock(&report).is_empty());
        det.close();
    }

    #[test]
    fn reaper_expires_overdue_locks() {
        let det = detector(30, 10);
        assert!(det.acquire_lock(
            op(1),
            &tid("t1"),
            ResourceType::Status,
            Duration::from_millis(30)
        ));
        assert_eq!(det.active_locks(), 1);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(det.active_locks(), 0);

        // Slot is usable again after expiry
        assert!(det.acquire_lock(op(2), &tid("t1"), ResourceType::Status, TIMEOUT));
        det.close();
    }

    #[test]
    fn expiry_wakes_parked_waiter() {
        let det = Arc::new(detector(5000, 2000));
        assert!(det.acquire_lock(
            op(1),
            &tid("t1"),
            ResourceType::Status,
            Duration::from_millis(100)
        ));

        // Waiter's window (max_wait 2s) outlives the holder's 100ms lease
        let waiter = {
            let det = Arc::clone(&det);
            thread::spawn(move || det.acquire_lock(op(2), &tid("t1"), ResourceType::Status, TIMEOUT))
        };

        assert!(waiter.join().unwrap());
        assert_eq!(det.tasks_held_by(op(2)), vec![tid("t1")]);
        det.close();
    }

    #[test]
    fn close_is_idempotent_and_stops_acquisition() {
        let det = detector(5000, 1000);
        assert!(det.acquire_lock(op(1), &tid("t1"), ResourceType::Status, TIMEOUT));

        det.close();
        det.close();

        assert_eq!(det.active_locks(), 0);
        assert!(!det.acquire_lock(op(2), &tid("t1"), ResourceType::Status, TIMEOUT));
    }
}
