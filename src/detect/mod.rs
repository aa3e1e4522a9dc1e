//! Deadlock detection and resolution
//!
//! Two layers. [`DeadlockDetector`] guards per-resource locks and watches the
//! wait-for graph between operations. [`PriorityStatusDetector`] wraps it and
//! additionally tracks semantic priority/status couplings between tasks,
//! which can deadlock without any lock contention at all.

mod detector;
mod lock_table;
mod semantic;
mod wait_graph;

pub use detector::{DeadlockDetector, DeadlockReport, LockResolution};
pub use lock_table::{ResourceLock, ResourceLockTable, ResourceType};
pub use semantic::{
    DependencyError, PriorityStatusDetector, SemanticReport, SemanticResolution, SemanticStats,
    Severity,
};
pub use wait_graph::{WaitCycle, WaitForGraph};
