//! Compare-and-set execution
//!
//! [`CasManager`] is the entry point for mutations; [`RetryPolicy`] and the
//! transient-error classifier decide which failures are worth another try.

mod manager;
mod retry;

pub use manager::{
    CasError, CasManager, CasOperation, CasOutcome, CasStats, ResourceUpdate, UpdateFn,
};
pub use retry::{is_transient, RetryPolicy};
