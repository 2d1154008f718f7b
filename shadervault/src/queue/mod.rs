//! Generic priority-ordered compile queue with a fixed worker-thread pool.
//!
//! The queue knows nothing about artifacts or cache keys; it schedules
//! two-phase [`WorkItem`]s. `compile()` runs on a worker thread (or inline
//! on the caller when no workers are running), `retrieve()` runs on the
//! thread that drains completions, which keeps result publication on a
//! single owning thread.

mod item;
mod pool;

pub use item::{Priority, WorkItem};
pub use pool::{QueueConfig, WorkQueue, WorkerInit, DEFAULT_POLL_INTERVAL};
