//! Request/response behaviour over the in-process transport.

use std::time::Duration;

use fleet_transport::{PortId, PortTransport, Transport, TransportError, WireMessage};
use serde_json::json;

const SERVICE: PortId = PortId::new(1);

/// Replies to every request with its payload doubled.
fn spawn_doubler(transport: PortTransport) {
    let mut inbox = transport.open(SERVICE).unwrap();
    tokio::spawn(async move {
        while let Some(Ok(request)) = inbox.read().await {
            let n = request.payload.as_i64().unwrap_or(0);
            if let Some(reply_to) = request.response_port {
                let _ = transport
                    .send(reply_to, WireMessage::new(99, json!(n * 2)))
                    .await;
            }
        }
    });
}

#[tokio::test]
async fn test_request_gets_correlated_reply() {
    let transport = PortTransport::default();
    spawn_doubler(transport.clone());

    let (a, b) = tokio::join!(
        transport.request(SERVICE, WireMessage::new(1, json!(2)), Duration::from_secs(1)),
        transport.request(SERVICE, WireMessage::new(1, json!(5)), Duration::from_secs(1)),
    );
    assert_eq!(a.unwrap().payload, json!(4));
    assert_eq!(b.unwrap().payload, json!(10));
}

#[tokio::test]
async fn test_request_to_closed_port_fails() {
    let transport = PortTransport::default();
    let err = transport
        .request(PortId::new(77), WireMessage::new(1, json!(null)), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Closed(PortId::new(77)));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_request_closes_response_port() {
    let transport = PortTransport::default();
    let mut inbox = transport.open(SERVICE).unwrap();

    let err = transport
        .request(SERVICE, WireMessage::new(1, json!(1)), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The service sees the request, but the caller is gone.
    let request = inbox.read().await.unwrap().unwrap();
    let reply_to = request.response_port.unwrap();
    assert!(!transport.is_open(reply_to));
    assert!(transport
        .try_send(reply_to, WireMessage::new(99, json!(null)))
        .unwrap_err()
        .is_closed());
}
