//! Batches end to end against a simulated host with the memory and launch
//! services running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_batcher::{BatchConfig, BatchError, BatchScheduler, BatchState, BatchWorker, Shape};
use fleet_host::{Host, ScriptDef, ScriptKind, ServerDef, SimHost, TargetDef, World};
use fleet_launcher::{LaunchConfig, LaunchService};
use fleet_memory::Ram;
use fleet_memory_service::{MemoryConfig, MemoryService};
use fleet_proto::{MemoryClient, PhaseKind};
use fleet_transport::PortTransport;
use tokio::sync::watch;

struct Fleet {
    host: SimHost,
    memory: MemoryClient<PortTransport>,
    scheduler: Arc<BatchScheduler<PortTransport>>,
    shutdown_rx: watch::Receiver<bool>,
    _shutdown: watch::Sender<bool>,
}

fn world() -> World {
    let script = |name: &str, ram_gb: f64, kind: ScriptKind| ScriptDef {
        name: name.to_string(),
        ram_gb,
        kind,
    };
    let target = |hostname: &str, money: Option<f64>, security: Option<f64>| TargetDef {
        hostname: hostname.to_string(),
        max_money: 1_000_000.0,
        money,
        min_security: 1.0,
        security,
        growth: 3_000.0,
        base_hack_ms: 1_000,
    };
    World {
        servers: vec![ServerDef {
            hostname: "home".to_string(),
            max_ram_gb: 64.0,
            used_ram_gb: 0.0,
            rooted: true,
        }],
        scripts: vec![
            script("hack.js", 1.7, ScriptKind::Hack),
            script("grow.js", 1.75, ScriptKind::Grow),
            script("weaken.js", 1.75, ScriptKind::Weaken),
        ],
        targets: vec![
            target("prepped", None, None),
            target("drained", Some(500_000.0), Some(1.5)),
        ],
    }
}

async fn start() -> Fleet {
    let transport = PortTransport::default();
    let host = SimHost::new(world(), transport.clone());
    let shared: Arc<dyn Host> = Arc::new(host.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let memory_config = MemoryConfig {
        refresh_interval_ms: 50,
        set_aside_gb: BTreeMap::new(),
        ..MemoryConfig::default()
    };
    let memory = MemoryService::bind(shared.clone(), transport.clone(), memory_config).unwrap();
    tokio::spawn(memory.run(shutdown_rx.clone()));

    let launch_config = LaunchConfig {
        retry_limit: 0,
        ..LaunchConfig::default()
    };
    let launcher = LaunchService::bind(shared.clone(), transport.clone(), &launch_config).unwrap();
    tokio::spawn(launcher.run(shutdown_rx.clone()));

    let batch_config = BatchConfig {
        spacing_ms: 80,
        hack_fraction: 0.02,
        heartbeat_grace_ms: 200,
        completion_grace_ms: 500,
        ..BatchConfig::default()
    };
    let scheduler = BatchScheduler::new(shared, transport.clone(), batch_config).unwrap();

    Fleet {
        host,
        memory: MemoryClient::new(transport),
        scheduler: Arc::new(scheduler),
        shutdown_rx,
        _shutdown: shutdown_tx,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn assert_released(fleet: &Fleet) {
    settle().await;
    assert!(fleet.host.processes(None).await.unwrap().is_empty());
    assert!(fleet.memory.snapshot().await.unwrap().allocations.is_empty());
    assert_eq!(fleet.memory.free_ram().await.unwrap(), Ram::from_gb(64));
}

#[tokio::test(start_paused = true)]
async fn test_hgw_batch_lands_in_order() {
    let fleet = start().await;

    let batch = fleet.scheduler.run("prepped").await.unwrap();
    assert_eq!(batch.shape, Shape::Hgw);
    assert_eq!(batch.state(), BatchState::AllCompleted, "{:?}", batch.reason());

    let landed: Vec<_> = [PhaseKind::Hack, PhaseKind::Grow, PhaseKind::Weaken]
        .iter()
        .map(|kind| batch.phase(*kind).unwrap().completed_at().unwrap())
        .collect();
    for pair in landed.windows(2) {
        assert!(pair[1] >= pair[0] + Duration::from_millis(80));
    }
    assert!(batch.phase(PhaseKind::Hack).unwrap().effect() > 0.0);

    let target = fleet.host.target("prepped").await.unwrap();
    assert_eq!(target.money, target.max_money);
    assert_eq!(target.security, target.min_security);

    assert_released(&fleet).await;
}

#[tokio::test(start_paused = true)]
async fn test_prep_batch_restores_target() {
    let fleet = start().await;

    let batch = fleet.scheduler.run("drained").await.unwrap();
    assert_eq!(batch.shape, Shape::Prep);
    assert_eq!(batch.state(), BatchState::AllCompleted, "{:?}", batch.reason());
    assert!(batch.phase(PhaseKind::Hack).is_none());

    let target = fleet.host.target("drained").await.unwrap();
    assert!(target.is_prepped(0.01), "{target:?}");

    assert_released(&fleet).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_launch_unwinds_batch() {
    let fleet = start().await;
    let batch = fleet.scheduler.plan("prepped").await.unwrap();

    // Leave room for hack and grow but not weaken.
    let needed = batch.phases[0].ram + batch.phases[1].ram;
    fleet
        .host
        .set_foreign_ram("home", Ram::from_gb(64).saturating_sub(needed))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let batch = fleet.scheduler.execute(batch).await.unwrap();
    assert_eq!(batch.state(), BatchState::PartialFailure);
    assert!(batch.reason().unwrap().contains("weaken"));

    settle().await;
    assert!(fleet.host.processes(None).await.unwrap().is_empty());
    assert!(fleet.memory.snapshot().await.unwrap().allocations.is_empty());
    let target = fleet.host.target("prepped").await.unwrap();
    assert_eq!(target.money, target.max_money);
}

#[tokio::test(start_paused = true)]
async fn test_missing_heartbeat_times_out() {
    let fleet = start().await;

    let host = fleet.host.clone();
    let saboteur = tokio::spawn(async move {
        loop {
            let grow = host
                .processes(None)
                .await
                .unwrap()
                .into_iter()
                .find(|p| p.script == "grow.js");
            if let Some(process) = grow {
                host.kill(process.pid).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let batch = fleet.scheduler.run("prepped").await.unwrap();
    saboteur.await.unwrap();

    assert_eq!(batch.state(), BatchState::TimedOut);
    assert_eq!(batch.reason(), Some("grow phase never started"));

    let target = fleet.host.target("prepped").await.unwrap();
    assert_eq!(target.money, target.max_money);
    assert_released(&fleet).await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_runs_limited_batches() {
    let fleet = start().await;

    let stats = BatchWorker::new(fleet.scheduler.clone(), "prepped")
        .continuous(true)
        .with_max_batches(Some(2))
        .with_interval(Duration::from_secs(5))
        .run(fleet.shutdown_rx.clone())
        .await;

    assert_eq!(stats.completed, 2);
    assert_eq!(stats.total(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_target_is_an_error() {
    let fleet = start().await;
    let err = fleet.scheduler.run("nowhere").await.unwrap_err();
    assert!(matches!(err, BatchError::Host(_)));
}
