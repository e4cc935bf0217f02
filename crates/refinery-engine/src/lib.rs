//! Runs compiled agent graphs.
//!
//! - [`WorkflowService`] validates the graph, creates the execution and submits
//!   its orchestration job.
//! - [`ExecutionCoordinator`] runs one agent step per queue job.
//! - [`ProgressTracker`] turns queue events into step and execution status.
//! - [`WorkflowRuntime`] wires these to a [`refinery_queue::MemoryQueue`] and
//!   its worker pool.

pub mod coordinator;
pub mod dispatch;
pub mod prompt;
pub mod run_log;
pub mod runtime;
pub mod tracker;
pub mod workflow;

pub use coordinator::ExecutionCoordinator;
pub use dispatch::JobDispatcher;
pub use run_log::ExecutionLogger;
pub use runtime::WorkflowRuntime;
pub use tracker::{CancelReport, ExecutionReport, Progress, ProgressTracker};
pub use workflow::{RecoveryReport, SeedReport, WorkflowService};
