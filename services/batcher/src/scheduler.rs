//! Planning, dispatching, and tracking batches.

use std::sync::Arc;

use fleet_host::Host;
use fleet_proto::{BatchSignal, LaunchArgs, LaunchClient, MemoryClient, PhaseKind, Protocol};
use fleet_transport::{PortReader, Transport};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::batch::{Batch, PhaseRun};
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::schedule::{Schedule, Shape};
use crate::sizing::size_phases;

/// Runs batches through the launch service.
pub struct BatchScheduler<T: Transport + Clone + 'static> {
    host: Arc<dyn Host>,
    transport: T,
    launch: LaunchClient<T>,
    memory: MemoryClient<T>,
    config: BatchConfig,
}

impl<T: Transport + Clone + 'static> BatchScheduler<T> {
    pub fn new(host: Arc<dyn Host>, transport: T, config: BatchConfig) -> Result<Self, BatchError> {
        config.validate()?;
        Ok(Self {
            launch: LaunchClient::new(transport.clone()),
            memory: MemoryClient::new(transport.clone()),
            host,
            transport,
            config,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Plans and runs one batch against `target`.
    pub async fn run(&self, target: &str) -> Result<Batch, BatchError> {
        let batch = self.plan(target).await?;
        self.execute(batch).await
    }

    /// Sizes and times a batch for the target's current state. A target
    /// away from min security or max money gets a prep batch.
    #[instrument(skip(self))]
    pub async fn plan(&self, target: &str) -> Result<Batch, BatchError> {
        let state = self.host.target(target).await?;
        let shape = if state.is_prepped(self.config.prep_tolerance) {
            Shape::Hgw
        } else {
            Shape::Prep
        };

        let threads = size_phases(self.host.as_ref(), &state, shape, self.config.hack_fraction).await?;

        let mut durations = Vec::with_capacity(threads.len());
        for (kind, _) in &threads {
            let duration = match kind {
                PhaseKind::Hack => self.host.hack_time(target).await?,
                PhaseKind::Grow => self.host.grow_time(target).await?,
                PhaseKind::Weaken => self.host.weaken_time(target).await?,
            };
            durations.push((*kind, duration));
        }
        let schedule = Schedule::compute(&durations, self.config.spacing());

        let mut phases = Vec::with_capacity(threads.len());
        for (timing, (_, threads)) in schedule.phases.iter().zip(&threads) {
            let script = self.script(timing.kind);
            let ram = self.host.script_ram(script).await?.times(*threads);
            phases.push(PhaseRun::new(script, *threads, ram, *timing));
        }

        let batch = Batch::new(target, shape, phases);
        debug!(
            batch_id = %batch.id,
            %shape,
            ram = %batch.ram(),
            makespan_ms = schedule.makespan().as_millis() as u64,
            "Planned batch"
        );
        Ok(batch)
    }

    /// Dispatches every phase, then waits for them to report.
    #[instrument(skip_all, fields(batch_id = %batch.id, target = %batch.target))]
    pub async fn execute(&self, mut batch: Batch) -> Result<Batch, BatchError> {
        let mut done_port = self.transport.open_ephemeral();
        batch.dispatch()?;

        for index in 0..batch.phases.len() {
            let args = self.launch_args(&batch, index, &done_port);
            let kind = batch.phases[index].kind();
            match self.launch.launch(args).await {
                Ok(result) => batch.record_launch(index, result, Instant::now()),
                Err(e) => {
                    warn!(phase = %kind, error = %e, "Phase failed to launch, aborting batch");
                    self.unwind(&batch).await;
                    batch.fail(format!("{kind} phase failed to launch: {e}"))?;
                    return Ok(batch);
                }
            }
        }
        info!(shape = %batch.shape, phases = batch.phases.len(), "Dispatched batch");

        self.track(&mut batch, &mut done_port).await?;
        Ok(batch)
    }

    fn script(&self, kind: PhaseKind) -> &str {
        match kind {
            PhaseKind::Hack => &self.config.hack_script,
            PhaseKind::Grow => &self.config.grow_script,
            PhaseKind::Weaken => &self.config.weaken_script,
        }
    }

    /// Phase scripts take `[target, delay_ms, done_port, batch_id, phase]`.
    fn launch_args(&self, batch: &Batch, index: usize, done_port: &PortReader) -> LaunchArgs {
        let phase = &batch.phases[index];
        LaunchArgs::new(phase.script.clone(), phase.threads, batch.owner())
            .with_args([
                batch.target.clone(),
                phase.timing.start.as_millis().to_string(),
                done_port.port().to_string(),
                batch.id.to_string(),
                phase.kind().to_string(),
            ])
            .all_or_nothing()
    }

    /// Reads the done port until every phase reports or a deadline passes.
    async fn track(&self, batch: &mut Batch, done_port: &mut PortReader) -> Result<(), BatchError> {
        let heartbeat_grace = self.config.heartbeat_grace();
        let completion_grace = self.config.completion_grace();

        loop {
            if batch.is_complete() {
                batch.complete()?;
                info!("Batch completed");
                return Ok(());
            }
            let Some(deadline) = batch.next_deadline(heartbeat_grace, completion_grace) else {
                batch.complete()?;
                return Ok(());
            };

            match tokio::time::timeout_at(deadline, done_port.read()).await {
                Ok(Some(Ok(message))) => match BatchSignal::from_message(message) {
                    Ok(signal) => {
                        if !batch.on_signal(&signal) {
                            debug!(signal = ?signal, "Ignoring signal for another batch");
                        }
                    }
                    Err(e) => warn!(error = %e, "Undecodable frame on done port"),
                },
                Ok(Some(Err(e))) => warn!(error = %e, "Malformed frame on done port"),
                Ok(None) => {
                    self.unwind(batch).await;
                    batch.time_out("done port closed")?;
                    return Ok(());
                }
                Err(_) => {
                    if let Some(reason) = batch.overdue(Instant::now(), heartbeat_grace, completion_grace) {
                        warn!(%reason, "Batch timed out");
                        self.unwind(batch).await;
                        batch.time_out(reason)?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Kills the batch's unfinished processes and releases its allocations.
    async fn unwind(&self, batch: &Batch) {
        for pid in batch.running_pids() {
            if let Err(e) = self.host.kill(pid).await {
                warn!(%pid, error = %e, "Kill failed during unwind");
            }
        }
        for id in batch.allocations() {
            if let Err(e) = self.memory.release_all(id).await {
                warn!(allocation_id = %id, error = %e, "Release failed during unwind");
            }
        }
    }
}
