//! Domain models for task records
//!
//! Contains the core data types without any locking or I/O concerns.

mod dependency;
mod id;
mod task;

pub use dependency::{
    DependencyCondition, DependencyKind, DependencyRef, PriorityStatusDependency,
};
pub use id::{IdError, OperationId, TaskId};
pub use task::{Task, TaskMeta, TaskPatch, TaskPriority, TaskStatus};
