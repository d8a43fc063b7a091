//! An in-memory host.
//!
//! Servers, scripts, and targets come from a [`World`]. Phase scripts behave
//! like their in-game counterparts: wait out their delay, report on the done
//! port, run for the phase duration, apply the effect, report again, and
//! exit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_id::{BatchId, Pid, PortId};
use fleet_memory::Ram;
use fleet_proto::{BatchSignal, PhaseKind, PhaseSignal, Protocol};
use fleet_transport::{PortTransport, Transport};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{HostError, HostResult};
use crate::formulas;
use crate::host::Host;
use crate::types::{ExitReason, ProcessExit, ProcessInfo, ServerInfo, TargetState};
use crate::world::{ScriptDef, ServerDef, World};

const EXIT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct ServerSlot {
    max_ram: Ram,
    foreign_ram: Ram,
    process_ram: Ram,
    rooted: bool,
}

impl ServerSlot {
    fn from_def(def: &ServerDef) -> Self {
        Self {
            max_ram: def.max_ram(),
            foreign_ram: def.used_ram(),
            process_ram: Ram::ZERO,
            rooted: def.rooted,
        }
    }

    fn used_ram(&self) -> Ram {
        self.foreign_ram + self.process_ram
    }

    fn info(&self, hostname: &str) -> ServerInfo {
        ServerInfo {
            hostname: hostname.to_string(),
            max_ram: self.max_ram,
            used_ram: self.used_ram(),
            rooted: self.rooted,
        }
    }
}

#[derive(Debug)]
struct ProcessSlot {
    info: ProcessInfo,
    task: Option<AbortHandle>,
}

#[derive(Debug, Default)]
struct WorldState {
    servers: BTreeMap<String, ServerSlot>,
    scripts: HashMap<String, ScriptDef>,
    targets: BTreeMap<String, TargetState>,
    processes: BTreeMap<Pid, ProcessSlot>,
    failing_hosts: HashSet<String>,
}

impl WorldState {
    fn target(&self, hostname: &str) -> HostResult<&TargetState> {
        self.targets
            .get(hostname)
            .ok_or_else(|| HostError::UnknownServer(hostname.to_string()))
    }
}

struct SimState {
    world: Mutex<WorldState>,
    exits: broadcast::Sender<ProcessExit>,
    transport: PortTransport,
    next_pid: AtomicU64,
    fail_next_execs: AtomicU32,
}

/// Arguments phase scripts take: `[target, delay_ms, done_port, batch_id, phase]`.
#[derive(Debug, Clone)]
struct PhaseArgs {
    target: String,
    delay: Duration,
    done_port: Option<PortId>,
    batch_id: Option<BatchId>,
}

impl PhaseArgs {
    fn parse(args: &[String]) -> Option<Self> {
        let target = args.first()?.clone();
        let delay_ms: u64 = match args.get(1) {
            Some(raw) => raw.parse().ok()?,
            None => 0,
        };
        Some(Self {
            target,
            delay: Duration::from_millis(delay_ms),
            done_port: args.get(2).and_then(|p| p.parse().ok()),
            batch_id: args.get(3).and_then(|b| b.parse().ok()),
        })
    }
}

/// [`Host`] over an in-memory [`World`].
///
/// Cheap to clone; clones share the world.
#[derive(Clone)]
pub struct SimHost {
    inner: Arc<SimState>,
}

impl std::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHost").finish_non_exhaustive()
    }
}

impl SimHost {
    /// Builds a host from `world`. Phase scripts report through `transport`.
    pub fn new(world: World, transport: PortTransport) -> Self {
        let state = WorldState {
            servers: world
                .servers
                .iter()
                .map(|s| (s.hostname.clone(), ServerSlot::from_def(s)))
                .collect(),
            scripts: world
                .scripts
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            targets: world
                .targets
                .iter()
                .map(|t| (t.hostname.clone(), t.state()))
                .collect(),
            ..WorldState::default()
        };
        let (exits, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SimState {
                world: Mutex::new(state),
                exits,
                transport,
                next_pid: AtomicU64::new(1),
                fail_next_execs: AtomicU32::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WorldState> {
        self.inner
            .world
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> &PortTransport {
        &self.inner.transport
    }

    /// Makes the next `count` execs fail.
    pub fn fail_next_execs(&self, count: u32) {
        self.inner.fail_next_execs.store(count, Ordering::SeqCst);
    }

    /// Makes every exec on `hostname` fail until cleared.
    pub fn set_host_failing(&self, hostname: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_hosts.insert(hostname.to_string());
        } else {
            state.failing_hosts.remove(hostname);
        }
    }

    /// Sets RAM used on `hostname` by things outside the simulation.
    pub fn set_foreign_ram(&self, hostname: &str, ram: Ram) -> HostResult<()> {
        let mut state = self.state();
        let slot = state
            .servers
            .get_mut(hostname)
            .ok_or_else(|| HostError::UnknownServer(hostname.to_string()))?;
        slot.foreign_ram = ram;
        Ok(())
    }

    pub fn set_rooted(&self, hostname: &str, rooted: bool) -> HostResult<()> {
        let mut state = self.state();
        let slot = state
            .servers
            .get_mut(hostname)
            .ok_or_else(|| HostError::UnknownServer(hostname.to_string()))?;
        slot.rooted = rooted;
        Ok(())
    }

    /// Replaces a target's state.
    pub fn set_target(&self, target: TargetState) {
        self.state().targets.insert(target.hostname.clone(), target);
    }

    fn check_exec_failure(&self, script: &str, hostname: &str, failing_host: bool) -> HostResult<()> {
        let injected = self
            .inner
            .fail_next_execs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || failing_host {
            return Err(HostError::ExecFailed {
                script: script.to_string(),
                hostname: hostname.to_string(),
                reason: "simulated start failure".to_string(),
            });
        }
        Ok(())
    }

    /// Removes a process, frees its RAM, and broadcasts the exit.
    fn finish(&self, pid: Pid, reason: ExitReason) -> bool {
        let slot = {
            let mut state = self.state();
            let Some(slot) = state.processes.remove(&pid) else {
                return false;
            };
            if let Some(server) = state.servers.get_mut(&slot.info.hostname) {
                server.process_ram = server.process_ram.saturating_sub(slot.info.ram);
            }
            slot
        };

        if reason == ExitReason::Killed {
            if let Some(task) = &slot.task {
                task.abort();
            }
        }
        debug!(%pid, script = %slot.info.script, hostname = %slot.info.hostname, ?reason, "Process exited");

        let _ = self.inner.exits.send(ProcessExit {
            pid,
            hostname: slot.info.hostname,
            script: slot.info.script,
            threads: slot.info.threads,
            ram: slot.info.ram,
            reason,
        });
        true
    }

    fn phase_duration(&self, phase: PhaseKind, target: &str) -> HostResult<Duration> {
        let state = self.state();
        let target = state.target(target)?;
        Ok(match phase {
            PhaseKind::Hack => formulas::hack_time(target),
            PhaseKind::Grow => formulas::grow_time(target),
            PhaseKind::Weaken => formulas::weaken_time(target),
        })
    }

    fn apply_phase(&self, phase: PhaseKind, target: &str, threads: u64) -> HostResult<f64> {
        let mut state = self.state();
        let target = state
            .targets
            .get_mut(target)
            .ok_or_else(|| HostError::UnknownServer(target.to_string()))?;
        Ok(match phase {
            PhaseKind::Hack => formulas::apply_hack(target, threads),
            PhaseKind::Grow => formulas::apply_grow(target, threads),
            PhaseKind::Weaken => formulas::apply_weaken(target, threads),
        })
    }

    async fn signal(&self, args: &PhaseArgs, signal: BatchSignal) {
        let (Some(port), Some(_)) = (args.done_port, args.batch_id) else {
            return;
        };
        let message = match signal.to_message(None) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to encode phase signal");
                return;
            }
        };
        if let Err(e) = self.inner.transport.send(port, message).await {
            debug!(%port, error = %e, "Phase signal dropped");
        }
    }

    async fn run_phase(self, pid: Pid, hostname: String, threads: u64, phase: PhaseKind, args: PhaseArgs) {
        tokio::time::sleep(args.delay).await;

        let duration = match self.phase_duration(phase, &args.target) {
            Ok(duration) => duration,
            Err(e) => {
                warn!(%pid, %phase, error = %e, "Phase script has no valid target");
                self.finish(pid, ExitReason::Finished);
                return;
            }
        };

        let signal = |effect: Option<f64>| PhaseSignal {
            batch_id: args.batch_id.unwrap_or_default(),
            phase,
            pid,
            hostname: hostname.clone(),
            effect,
        };

        self.signal(&args, BatchSignal::Started(signal(None))).await;
        tokio::time::sleep(duration).await;

        match self.apply_phase(phase, &args.target, threads) {
            Ok(effect) => {
                debug!(%pid, %phase, target = %args.target, effect, "Phase resolved");
                self.signal(&args, BatchSignal::Done(signal(Some(effect)))).await;
            }
            Err(e) => warn!(%pid, %phase, error = %e, "Phase target vanished"),
        }
        self.finish(pid, ExitReason::Finished);
    }
}

#[async_trait]
impl Host for SimHost {
    async fn list_servers(&self) -> HostResult<Vec<ServerInfo>> {
        let state = self.state();
        Ok(state
            .servers
            .iter()
            .map(|(hostname, slot)| slot.info(hostname))
            .collect())
    }

    async fn server(&self, hostname: &str) -> HostResult<ServerInfo> {
        let state = self.state();
        state
            .servers
            .get(hostname)
            .map(|slot| slot.info(hostname))
            .ok_or_else(|| HostError::UnknownServer(hostname.to_string()))
    }

    async fn script_ram(&self, script: &str) -> HostResult<Ram> {
        let state = self.state();
        state
            .scripts
            .get(script)
            .map(ScriptDef::ram)
            .ok_or_else(|| HostError::UnknownScript(script.to_string()))
    }

    async fn exec(
        &self,
        script: &str,
        hostname: &str,
        threads: u64,
        args: &[String],
    ) -> HostResult<Pid> {
        if threads == 0 {
            return Err(HostError::InvalidArgument("threads must be positive".to_string()));
        }

        let (pid, kind) = {
            let mut state = self.state();
            let def = state
                .scripts
                .get(script)
                .cloned()
                .ok_or_else(|| HostError::UnknownScript(script.to_string()))?;
            let failing_host = state.failing_hosts.contains(hostname);
            let server = state
                .servers
                .get_mut(hostname)
                .ok_or_else(|| HostError::UnknownServer(hostname.to_string()))?;
            if !server.rooted {
                return Err(HostError::NotRooted(hostname.to_string()));
            }

            let required = def.ram().times(threads);
            let available = server.max_ram.saturating_sub(server.used_ram());
            if required > available {
                return Err(HostError::InsufficientRam {
                    hostname: hostname.to_string(),
                    script: script.to_string(),
                    required,
                    available,
                });
            }
            self.check_exec_failure(script, hostname, failing_host)?;

            server.process_ram += required;
            let pid = Pid::new(self.inner.next_pid.fetch_add(1, Ordering::SeqCst));
            state.processes.insert(
                pid,
                ProcessSlot {
                    info: ProcessInfo {
                        pid,
                        script: script.to_string(),
                        hostname: hostname.to_string(),
                        threads,
                        args: args.to_vec(),
                        ram: required,
                        started_at: Utc::now(),
                    },
                    task: None,
                },
            );
            (pid, def.kind)
        };
        info!(%pid, %script, %hostname, threads, "Started process");

        if let Some(phase) = kind.phase() {
            let task = match PhaseArgs::parse(args) {
                Some(phase_args) => tokio::spawn(self.clone().run_phase(
                    pid,
                    hostname.to_string(),
                    threads,
                    phase,
                    phase_args,
                )),
                None => {
                    warn!(%pid, %script, ?args, "Phase script started without a target");
                    let host = self.clone();
                    tokio::spawn(async move {
                        host.finish(pid, ExitReason::Finished);
                    })
                }
            };
            if let Some(slot) = self.state().processes.get_mut(&pid) {
                slot.task = Some(task.abort_handle());
            }
        }
        Ok(pid)
    }

    async fn kill(&self, pid: Pid) -> HostResult<bool> {
        Ok(self.finish(pid, ExitReason::Killed))
    }

    async fn is_running(&self, pid: Pid) -> HostResult<bool> {
        Ok(self.state().processes.contains_key(&pid))
    }

    async fn processes(&self, hostname: Option<&str>) -> HostResult<Vec<ProcessInfo>> {
        let state = self.state();
        Ok(state
            .processes
            .values()
            .filter(|slot| hostname.map_or(true, |h| slot.info.hostname == h))
            .map(|slot| slot.info.clone())
            .collect())
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit> {
        self.inner.exits.subscribe()
    }

    async fn target(&self, hostname: &str) -> HostResult<TargetState> {
        self.state().target(hostname).cloned()
    }

    async fn hack_time(&self, hostname: &str) -> HostResult<Duration> {
        self.state().target(hostname).map(formulas::hack_time)
    }

    async fn grow_time(&self, hostname: &str) -> HostResult<Duration> {
        self.state().target(hostname).map(formulas::grow_time)
    }

    async fn weaken_time(&self, hostname: &str) -> HostResult<Duration> {
        self.state().target(hostname).map(formulas::weaken_time)
    }

    async fn hack_fraction_per_thread(&self, hostname: &str) -> HostResult<f64> {
        self.state()
            .target(hostname)
            .map(formulas::hack_fraction_per_thread)
    }

    async fn grow_threads_for(&self, hostname: &str, multiplier: f64) -> HostResult<u64> {
        self.state()
            .target(hostname)
            .map(|t| formulas::grow_threads_for(t, multiplier))
    }
}
