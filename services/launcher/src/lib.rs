//! Launch service.
//!
//! Turns "run this script with N threads" into processes on workers:
//! - Allocations are sized from the script's RAM and placed by the memory service
//! - Failed process starts are retried with exponential back-off
//! - Workers that never start give their RAM back; the gap shows in the result
//! - Started processes release their worker's chunks when they exit

pub mod backoff;
pub mod config;
pub mod error;
pub mod launcher;
pub mod service;

pub use backoff::BackoffPolicy;
pub use config::LaunchConfig;
pub use error::LaunchError;
pub use launcher::Launcher;
pub use service::LaunchService;
