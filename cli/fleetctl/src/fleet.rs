//! An in-process fleet: the simulated host plus the memory and launch
//! services, all on one port transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_batcher::BatchScheduler;
use fleet_host::{Host, SimHost, World};
use fleet_launcher::LaunchService;
use fleet_memory_service::MemoryService;
use fleet_proto::{LaunchClient, MemoryClient};
use fleet_transport::PortTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::FleetConfig;

pub struct Fleet {
    host: Arc<dyn Host>,
    transport: PortTransport,
    config: FleetConfig,
    shutdown_tx: watch::Sender<bool>,
    services: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl Fleet {
    /// Loads the world and starts both services.
    pub async fn boot(config: &FleetConfig) -> Result<Self> {
        let world = match &config.world {
            Some(path) => World::load(path)
                .with_context(|| format!("Failed to load world from {}", path.display()))?,
            None => World::demo(),
        };
        info!(
            servers = world.servers.len(),
            scripts = world.scripts.len(),
            targets = world.targets.len(),
            "Booting fleet"
        );

        let transport = PortTransport::default();
        let host: Arc<dyn Host> = Arc::new(SimHost::new(world, transport.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let memory = MemoryService::bind(host.clone(), transport.clone(), config.memory.clone())
            .context("Failed to bind memory service")?;
        let launcher = LaunchService::bind(host.clone(), transport.clone(), &config.launch)
            .context("Failed to bind launch service")?;

        let memory_shutdown = shutdown_rx.clone();
        let services = vec![
            (
                "memory",
                tokio::spawn(async move {
                    memory.run(memory_shutdown).await.map_err(anyhow::Error::from)
                }),
            ),
            (
                "launch",
                tokio::spawn(async move {
                    launcher.run(shutdown_rx).await.map_err(anyhow::Error::from)
                }),
            ),
        ];

        Ok(Self {
            host,
            transport,
            config: config.clone(),
            shutdown_tx,
            services,
        })
    }

    pub fn memory(&self) -> MemoryClient<PortTransport> {
        MemoryClient::new(self.transport.clone())
            .with_timeout(self.config.launch.memory_timeout())
            .with_conflict_retries(self.config.memory.conflict_retries)
    }

    pub fn launcher(&self) -> LaunchClient<PortTransport> {
        LaunchClient::new(self.transport.clone())
    }

    pub fn scheduler(&self) -> Result<BatchScheduler<PortTransport>> {
        BatchScheduler::new(self.host.clone(), self.transport.clone(), self.config.batch.clone())
            .context("Invalid batch configuration")
    }

    /// Signals both services and waits for them to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.services {
            match handle.await {
                Ok(Ok(())) => info!(service = name, "Service stopped"),
                Ok(Err(e)) => warn!(service = name, error = %e, "Service stopped with error"),
                Err(e) => warn!(service = name, error = %e, "Service task failed"),
            }
        }
    }
}
