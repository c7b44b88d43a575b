//! Sequential task queue: ordering ([`QueueManager`]) and per-project
//! mutual exclusion ([`ProjectLockTable`]).

pub mod lock;
pub mod manager;

pub use lock::{ProjectLease, ProjectLockTable};
pub use manager::{QueueManager, RetryPolicy};
