//! Deadlock-aware optimistic concurrency control for shared task records
//!
//! Tasks expose three independently lockable fields (status, priority,
//! metadata) and a version counter. Mutations go through [`CasManager`]:
//! read a snapshot, compute a patch, and apply it only if the version is
//! unchanged, retrying transient failures with exponential backoff. A
//! layered detector watches for lock-level deadlocks between operations and
//! for semantic priority/status dependency cycles between tasks, and knows
//! how to break both.

pub mod cas;
pub mod config;
pub mod detect;
pub mod domain;
pub mod store;
pub mod validate;

pub use cas::{CasError, CasManager, CasOutcome, ResourceUpdate, UpdateFn};
pub use config::TasklockConfig;
pub use detect::{PriorityStatusDetector, ResourceType, SemanticReport};
pub use domain::{Task, TaskId, TaskPatch, TaskPriority, TaskStatus};
pub use store::{MemoryTaskStore, TaskStore};
