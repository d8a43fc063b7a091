//! Batch scheduler.
//!
//! Lands hack, grow, and weaken operations against a target in a fixed
//! order:
//! - Phase start delays are computed so completions are `spacing` apart
//! - Thread counts come from the target's state and the host's formulas
//! - Every phase launches all-or-nothing; a failed launch unwinds the batch
//! - Phase scripts report on a per-batch done port, checked against deadlines

pub mod batch;
pub mod config;
pub mod error;
pub mod schedule;
pub mod scheduler;
pub mod sizing;
pub mod worker;

pub use batch::{Batch, BatchState, PhaseRun};
pub use config::BatchConfig;
pub use error::BatchError;
pub use schedule::{PhaseTiming, Schedule, Shape};
pub use scheduler::BatchScheduler;
pub use worker::{BatchStats, BatchWorker};
