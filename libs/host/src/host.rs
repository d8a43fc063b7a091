//! The host capability surface.

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::Pid;
use fleet_memory::Ram;
use tokio::sync::broadcast;

use crate::error::HostResult;
use crate::types::{ProcessExit, ProcessInfo, ServerInfo, TargetState};

/// Everything the services need from the world they run in.
#[async_trait]
pub trait Host: Send + Sync {
    /// Every known server.
    async fn list_servers(&self) -> HostResult<Vec<ServerInfo>>;

    async fn server(&self, hostname: &str) -> HostResult<ServerInfo>;

    /// RAM one thread of `script` needs.
    async fn script_ram(&self, script: &str) -> HostResult<Ram>;

    /// Starts `script` on `hostname` with `threads` threads.
    async fn exec(
        &self,
        script: &str,
        hostname: &str,
        threads: u64,
        args: &[String],
    ) -> HostResult<Pid>;

    /// Stops a process. Returns false if it was not running.
    async fn kill(&self, pid: Pid) -> HostResult<bool>;

    async fn is_running(&self, pid: Pid) -> HostResult<bool>;

    /// Running processes, optionally on one server.
    async fn processes(&self, hostname: Option<&str>) -> HostResult<Vec<ProcessInfo>>;

    /// A stream of process exits from now on.
    fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit>;

    async fn target(&self, hostname: &str) -> HostResult<TargetState>;

    async fn hack_time(&self, hostname: &str) -> HostResult<Duration>;

    async fn grow_time(&self, hostname: &str) -> HostResult<Duration>;

    async fn weaken_time(&self, hostname: &str) -> HostResult<Duration>;

    /// Fraction of current money one hack thread steals.
    async fn hack_fraction_per_thread(&self, hostname: &str) -> HostResult<f64>;

    /// Grow threads needed to multiply money by `multiplier`.
    async fn grow_threads_for(&self, hostname: &str, multiplier: f64) -> HostResult<u64>;
}
