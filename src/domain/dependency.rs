//! Priority/status dependencies between tasks
//!
//! These edges express semantic coupling ("task A's priority depends on
//! task B's status") that can deadlock even when no two operations ever
//! contend for the same lock. The detector in [`crate::detect::semantic`]
//! walks them for cycles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::domain::id::TaskId;
use crate::domain::task::Task;

/// Which field of the owning task depends on which field of the other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// This task's priority is gated on the other task's status
    PriorityDependsOnStatus,
    /// This task's status is gated on the other task's priority
    StatusDependsOnPriority,
}

impl DependencyKind {
    /// The opposite coupling direction
    pub fn inverse(&self) -> Self {
        match self {
            DependencyKind::PriorityDependsOnStatus => DependencyKind::StatusDependsOnPriority,
            DependencyKind::StatusDependsOnPriority => DependencyKind::PriorityDependsOnStatus,
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            DependencyKind::PriorityDependsOnStatus => "priority_depends_on_status",
            DependencyKind::StatusDependsOnPriority => "status_depends_on_priority",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Predicate deciding whether a dependency currently binds
///
/// Receives the owning task and the task it depends on. Returning `Ok(false)`
/// means the dependency is inert right now; returning an error fails
/// validation outright.
pub type DependencyCondition = Arc<dyn Fn(&Task, &Task) -> anyhow::Result<bool> + Send + Sync>;

/// A semantic dependency edge from one task's field to another's
#[derive(Clone)]
pub struct PriorityStatusDependency {
    /// Task owning the gated field
    pub task_id: TaskId,
    /// Task whose field the gate reads
    pub depends_on: TaskId,
    pub kind: DependencyKind,
    /// Nesting depth; 0 is a direct dependency
    pub level: u32,
    pub condition: DependencyCondition,
}

impl PriorityStatusDependency {
    /// Creates a dependency with an explicit condition
    pub fn new(
        task_id: TaskId,
        depends_on: TaskId,
        kind: DependencyKind,
        level: u32,
        condition: DependencyCondition,
    ) -> Self {
        Self {
            task_id,
            depends_on,
            kind,
            level,
            condition,
        }
    }

    /// Creates a dependency whose condition always binds
    pub fn unconditional(
        task_id: TaskId,
        depends_on: TaskId,
        kind: DependencyKind,
        level: u32,
    ) -> Self {
        Self::new(task_id, depends_on, kind, level, Arc::new(|_, _| Ok(true)))
    }

    /// Serializable view of this edge without the condition closure
    pub fn to_ref(&self) -> DependencyRef {
        DependencyRef {
            task_id: self.task_id.clone(),
            depends_on: self.depends_on.clone(),
            kind: self.kind,
            level: self.level,
        }
    }
}

impl fmt::Debug for PriorityStatusDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityStatusDependency")
            .field("task_id", &self.task_id)
            .field("depends_on", &self.depends_on)
            .field("kind", &self.kind)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Condition-free description of a dependency edge, used in reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub task_id: TaskId,
    pub depends_on: TaskId,
    pub kind: DependencyKind,
    pub level: u32,
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{} L{}]-> {}",
            self.task_id, self.kind, self.level, self.depends_on
        )
    }
}
