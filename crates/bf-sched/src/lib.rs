//! The scheduler — matches ready buildlets to the highest-priority waiter
//! per host type, driving pool creation only when demand exists.
//!
//! Priority is strict and total: gomote sessions first, then try-bot work
//! (FIFO), then post-submit work (LIFO by commit time, so newest-commit
//! failures surface first). Ties break on a monotonic enqueue id, so no two
//! items ever compare equal.

pub mod item;
pub mod scheduler;

pub use item::{sched_less, SchedItem};
pub use scheduler::{Scheduler, SchedulerSnapshot};
