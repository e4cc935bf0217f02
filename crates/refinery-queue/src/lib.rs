//! Job queue used to run compiled workflows.
//!
//! `MemoryQueue` holds jobs in process and releases a parent only after all of
//! its children completed. `WorkerPool` pulls ready jobs and hands them to a
//! `JobHandler`, feeding success or failure back into the queue.

pub mod memory;
pub mod worker;

pub use memory::{JobState, MemoryQueue};
pub use worker::WorkerPool;
