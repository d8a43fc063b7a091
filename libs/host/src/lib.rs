//! # fleet-host
//!
//! The host runtime the services run against.
//!
//! [`Host`] is the capability surface: server RAM, process control, exit
//! notifications, and target state with the game formulas. [`SimHost`] is an
//! in-memory implementation driven by a [`World`] definition; its phase
//! scripts report progress over the same ports the services use.

mod error;
pub mod formulas;
mod host;
mod sim;
mod types;
mod world;

pub use error::{HostError, HostResult};
pub use host::Host;
pub use sim::SimHost;
pub use types::{ExitReason, ProcessExit, ProcessInfo, ServerInfo, TargetState};
pub use world::{ScriptDef, ScriptKind, ServerDef, TargetDef, World};
