//! Client behaviour against a hand-rolled memory endpoint.

use std::time::Duration;

use chrono::Utc;
use fleet_id::{AllocationId, PortId};
use fleet_memory::{Allocation, Chunk, ChunkRequest, MemorySnapshot, Ram, Worker};
use fleet_proto::{
    reply_message, MemoryClient, MemoryRequest, MemoryResponse, Protocol, ServiceError,
};
use fleet_transport::{PortRegistry, PortTransport, Transport};

fn allocation(id: u64) -> Allocation {
    Allocation {
        id: AllocationId::new(id),
        owner: "test".into(),
        chunk_size: Ram::from_gb(1),
        chunks: vec![Chunk {
            hostname: "home".into(),
            threads: 2,
        }],
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_dropping_guard_sends_release() {
    let transport = PortTransport::default();
    let mut inbox = transport.open(PortId::MEMORY).unwrap();
    let client = MemoryClient::new(transport.clone());

    {
        let _guard = client.guard(allocation(7));
    }

    let frame = inbox.read().await.unwrap().unwrap();
    assert_eq!(frame.response_port, None);
    assert_eq!(
        MemoryRequest::from_message(frame).unwrap(),
        MemoryRequest::ReleaseAll {
            id: AllocationId::new(7)
        }
    );
}

#[tokio::test]
async fn test_disarmed_guard_sends_nothing() {
    let transport = PortTransport::default();
    let mut inbox = transport.open(PortId::MEMORY).unwrap();
    let client = MemoryClient::new(transport.clone());

    let kept = client.guard(allocation(3)).disarm();
    assert_eq!(kept.map(|a| a.id), Some(AllocationId::new(3)));
    assert!(inbox.try_read().is_none());
}

#[tokio::test]
async fn test_full_port_defers_release() {
    let transport = PortTransport::new(PortRegistry::new(1));
    let mut inbox = transport.open(PortId::MEMORY).unwrap();
    let client = MemoryClient::new(transport.clone());

    client.service().try_notify(&MemoryRequest::FreeRam).unwrap();
    drop(client.guard(allocation(9)));

    // First frame is the filler, the release follows once there is room.
    let first = inbox.read().await.unwrap().unwrap();
    assert_eq!(
        MemoryRequest::from_message(first).unwrap(),
        MemoryRequest::FreeRam
    );
    let second = inbox.read().await.unwrap().unwrap();
    assert_eq!(
        MemoryRequest::from_message(second).unwrap(),
        MemoryRequest::ReleaseAll {
            id: AllocationId::new(9)
        }
    );
}

/// Serves snapshots from a fixed fleet and rejects the first commit.
async fn flaky_commit_service(transport: PortTransport) {
    let mut inbox = transport.open(PortId::MEMORY).unwrap();
    let snapshot = MemorySnapshot::new(vec![Worker::new("home", Ram::from_gb(8))], Vec::new());
    let mut commits = 0;

    while let Some(Ok(frame)) = inbox.read().await {
        let reply_to = frame.response_port.unwrap();
        let result = match MemoryRequest::from_message(frame).unwrap() {
            MemoryRequest::Snapshot => Ok(MemoryResponse::Snapshot(snapshot.clone())),
            MemoryRequest::CommitPlan(args) => {
                commits += 1;
                if commits == 1 {
                    Err(ServiceError::AllocationConflict {
                        hostname: "home".into(),
                        required: args.plan.total_ram(),
                        available: Ram::ZERO,
                    })
                } else {
                    let mut allocation = allocation(commits);
                    allocation.chunk_size = args.plan.chunk_size;
                    Ok(MemoryResponse::Allocation(allocation))
                }
            }
            other => Err(ServiceError::invalid(format!("unhandled {other:?}"))),
        };
        let _ = transport
            .send(reply_to, reply_message(&result).unwrap())
            .await;
    }
}

#[tokio::test]
async fn test_allocate_planned_retries_conflicts() {
    let transport = PortTransport::default();
    tokio::spawn(flaky_commit_service(transport.clone()));
    tokio::task::yield_now().await;

    let client = MemoryClient::new(transport).with_timeout(Duration::from_secs(1));
    let allocation = client
        .allocate_planned("cli".into(), ChunkRequest::new(Ram::from_gb(2), 2))
        .await
        .unwrap();
    assert_eq!(allocation.id, AllocationId::new(2));
    assert_eq!(allocation.chunk_size, Ram::from_gb(2));
}

#[tokio::test]
async fn test_conflict_surfaces_without_retries() {
    let transport = PortTransport::default();
    tokio::spawn(flaky_commit_service(transport.clone()));
    tokio::task::yield_now().await;

    let client = MemoryClient::new(transport).with_conflict_retries(0);
    let err = client
        .allocate_planned("cli".into(), ChunkRequest::new(Ram::from_gb(2), 2))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_planning_failure_is_capacity_error() {
    let transport = PortTransport::default();
    tokio::spawn(flaky_commit_service(transport.clone()));
    tokio::task::yield_now().await;

    let client = MemoryClient::new(transport);
    let err = client
        .allocate_planned("cli".into(), ChunkRequest::new(Ram::from_gb(4), 3))
        .await
        .unwrap_err();
    assert_eq!(err.as_service().and_then(ServiceError::satisfiable), Some(2));
}
