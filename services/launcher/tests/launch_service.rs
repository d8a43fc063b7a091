//! Launch service end to end: simulated host, memory service, launch port.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_host::{Host, ScriptDef, ScriptKind, ServerDef, SimHost, World};
use fleet_launcher::{LaunchConfig, LaunchService};
use fleet_memory::{ChunkRequest, Ram};
use fleet_memory_service::{MemoryConfig, MemoryService};
use fleet_proto::{LaunchArgs, LaunchClient, MemoryClient, ServiceError};
use fleet_transport::PortTransport;
use tokio::sync::watch;

struct Fleet {
    host: SimHost,
    memory: MemoryClient<PortTransport>,
    launch: LaunchClient<PortTransport>,
    _shutdown: watch::Sender<bool>,
}

fn world() -> World {
    let server = |hostname: &str, max_ram_gb: f64| ServerDef {
        hostname: hostname.to_string(),
        max_ram_gb,
        used_ram_gb: 0.0,
        rooted: true,
    };
    World {
        servers: vec![server("alpha", 8.0), server("beta", 4.0)],
        scripts: vec![ScriptDef {
            name: "share.js".to_string(),
            ram_gb: 2.0,
            kind: ScriptKind::Daemon,
        }],
        targets: Vec::new(),
    }
}

async fn start(retry_limit: u32) -> Fleet {
    let transport = PortTransport::default();
    let host = SimHost::new(world(), transport.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let memory_config = MemoryConfig {
        refresh_interval_ms: 50,
        set_aside_gb: BTreeMap::new(),
        ..MemoryConfig::default()
    };
    let memory = MemoryService::bind(Arc::new(host.clone()), transport.clone(), memory_config).unwrap();
    tokio::spawn(memory.run(shutdown_rx.clone()));

    let launch_config = LaunchConfig {
        retry_limit,
        backoff_jitter: 0.0,
        ..LaunchConfig::default()
    };
    let launcher = LaunchService::bind(Arc::new(host.clone()), transport.clone(), &launch_config).unwrap();
    tokio::spawn(launcher.run(shutdown_rx));

    Fleet {
        host,
        memory: MemoryClient::new(transport.clone()),
        launch: LaunchClient::new(transport),
        _shutdown: shutdown_tx,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_launch_spreads_threads_largest_first() {
    let fleet = start(0).await;

    let result = fleet
        .launch
        .launch(LaunchArgs::new("share.js", 5, "test"))
        .await
        .unwrap();

    let shape: Vec<_> = result
        .placements
        .iter()
        .map(|p| (p.hostname.as_str(), p.threads, p.pid.is_some()))
        .collect();
    assert_eq!(shape, vec![("alpha", 4, true), ("beta", 1, true)]);
    assert!(!result.has_gaps());
    assert_eq!(fleet.memory.free_ram().await.unwrap(), Ram::from_gb(2));
    assert_eq!(fleet.host.processes(None).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_process_exit_releases_its_worker() {
    let fleet = start(0).await;
    let result = fleet
        .launch
        .launch(LaunchArgs::new("share.js", 5, "test"))
        .await
        .unwrap();

    let alpha_pid = result.placements[0].pid.unwrap();
    fleet.host.kill(alpha_pid).await.unwrap();
    settle().await;

    let snapshot = fleet.memory.snapshot().await.unwrap();
    assert_eq!(snapshot.allocations.len(), 1);
    assert_eq!(snapshot.allocations[0].hostnames(), vec!["beta"]);
    assert_eq!(fleet.memory.free_ram().await.unwrap(), Ram::from_gb(10));

    let beta_pid = result.placements[1].pid.unwrap();
    fleet.host.kill(beta_pid).await.unwrap();
    settle().await;
    assert!(fleet.memory.snapshot().await.unwrap().allocations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_exec_failures_are_retried() {
    let fleet = start(3).await;
    fleet.host.fail_next_execs(2);

    let result = fleet
        .launch
        .launch(LaunchArgs::new("share.js", 2, "test"))
        .await
        .unwrap();
    assert_eq!(result.started_threads(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_worker_is_a_gap_and_gives_ram_back() {
    let fleet = start(1).await;
    fleet.host.set_host_failing("beta", true);

    let result = fleet
        .launch
        .launch(LaunchArgs::new("share.js", 6, "test"))
        .await
        .unwrap();

    assert_eq!(result.pids().len(), 2);
    assert!(result.pids()[0].is_some());
    assert!(result.pids()[1].is_none());
    assert!(result.placements[1].error.is_some());
    assert_eq!(result.allocation.hostnames(), vec!["alpha"]);
    assert_eq!(fleet.memory.free_ram().await.unwrap(), Ram::from_gb(4));
}

#[tokio::test(start_paused = true)]
async fn test_all_or_nothing_unwinds_everything() {
    let fleet = start(1).await;
    fleet.host.set_host_failing("beta", true);

    let err = fleet
        .launch
        .launch(LaunchArgs::new("share.js", 6, "test").all_or_nothing())
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_service(),
        Some(ServiceError::LaunchFailure { .. })
    ));

    settle().await;
    assert!(fleet.host.processes(None).await.unwrap().is_empty());
    assert_eq!(fleet.memory.free_ram().await.unwrap(), Ram::from_gb(12));
    assert!(fleet.memory.snapshot().await.unwrap().allocations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_capacity_and_argument_errors() {
    let fleet = start(0).await;

    let err = fleet
        .launch
        .launch(LaunchArgs::new("share.js", 7, "test"))
        .await
        .unwrap_err();
    assert_eq!(err.as_service().and_then(ServiceError::satisfiable), Some(6));

    let err = fleet
        .launch
        .launch(LaunchArgs::new("missing.js", 1, "test"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_service(),
        Some(ServiceError::InvalidArgument { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_launch_into_existing_allocation() {
    let fleet = start(0).await;
    let held = fleet
        .memory
        .allocate("owner".into(), ChunkRequest::new(Ram::from_gb(2), 4))
        .await
        .unwrap();

    let result = fleet
        .launch
        .launch(LaunchArgs::new("share.js", 3, "owner").into_allocation(held.id))
        .await
        .unwrap();
    assert_eq!(result.allocation.id, held.id);
    assert_eq!(result.started_threads(), 3);

    // Processes inside the held chunks are not counted again after refresh.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(fleet.memory.free_ram().await.unwrap(), Ram::from_gb(4));
    let snapshot = fleet.memory.snapshot().await.unwrap();
    assert!(snapshot.workers.iter().all(|w| w.reserved_ram().is_zero()));

    // The caller keeps the allocation after its processes stop.
    for pid in result.started_pids() {
        fleet.host.kill(pid).await.unwrap();
    }
    settle().await;
    let snapshot = fleet.memory.snapshot().await.unwrap();
    assert_eq!(snapshot.allocations.len(), 1);
    assert_eq!(fleet.memory.free_ram().await.unwrap(), Ram::from_gb(4));
}
