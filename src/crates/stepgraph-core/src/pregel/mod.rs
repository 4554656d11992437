//! Superstep execution engine
//!
//! The engine divides a run into **supersteps**: read channels, execute
//! every due node concurrently, barrier, merge writes, checkpoint,
//! repeat until no work remains or an interrupt/error halts the run.
//!
//! - [`types`] - tasks, node specs, reserved names, deterministic ids
//! - [`algo`] - task scheduling and write application
//! - [`executor`] - background executor and the retry driver
//! - [`runner`] - one superstep's concurrent execution
//! - [`loop_impl`] - the superstep loop and checkpoint lifecycle

pub mod algo;
pub mod executor;
pub mod loop_impl;
pub mod runner;
pub mod types;

pub use algo::{apply_writes, prepare_next_tasks, AppliedWrites};
pub use executor::{run_with_retry, BackgroundExecutor};
pub use loop_impl::{LoopOptions, PregelLoop};
pub use runner::{ExecTask, SuperstepOutput, SuperstepRunner, TaskOutcome, TaskRunResult};
pub use types::{reserved, task_id, NodeSpec, Task, TaskPath, TaskWrites, END, START};
