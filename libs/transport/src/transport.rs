//! The transport abstraction used by every client and service.

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::PortId;
use tracing::{debug, instrument};

use crate::envelope::WireMessage;
use crate::error::{TransportError, TransportResult};
use crate::port::{PortReader, PortRegistry};

/// Send, try-send, and send-and-await over ports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes a frame, waiting for space.
    async fn send(&self, port: PortId, message: WireMessage) -> TransportResult<()>;

    /// Writes a frame if the port has room right now.
    fn try_send(&self, port: PortId, message: WireMessage) -> TransportResult<()>;

    /// Sends `message` with a fresh response port and waits for one reply.
    ///
    /// The response port is closed when this returns, whether or not a
    /// reply arrived.
    async fn request(
        &self,
        port: PortId,
        message: WireMessage,
        timeout: Duration,
    ) -> TransportResult<WireMessage>;

    /// Opens a port to read from.
    fn open(&self, port: PortId) -> TransportResult<PortReader>;

    /// Opens a port in the ephemeral range.
    fn open_ephemeral(&self) -> PortReader;

    /// Whether anyone still reads `port`.
    fn is_open(&self, port: PortId) -> bool;
}

/// [`Transport`] over an in-process [`PortRegistry`].
#[derive(Debug, Clone, Default)]
pub struct PortTransport {
    registry: PortRegistry,
}

impl PortTransport {
    pub fn new(registry: PortRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }
}

#[async_trait]
impl Transport for PortTransport {
    async fn send(&self, port: PortId, message: WireMessage) -> TransportResult<()> {
        self.registry.writer(port)?.write(&message).await
    }

    fn try_send(&self, port: PortId, message: WireMessage) -> TransportResult<()> {
        self.registry.writer(port)?.try_write(&message)
    }

    #[instrument(skip(self, message), fields(tag = message.tag))]
    async fn request(
        &self,
        port: PortId,
        message: WireMessage,
        timeout: Duration,
    ) -> TransportResult<WireMessage> {
        let mut reply_port = self.registry.open_ephemeral();
        let reply_to = reply_port.port();
        let message = message.with_response_port(reply_to);

        let outcome = tokio::time::timeout(timeout, async {
            self.send(port, message).await?;
            reply_port
                .read()
                .await
                .unwrap_or(Err(TransportError::Closed(reply_to)))
        })
        .await;
        reply_port.close();

        match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!(%port, %reply_to, ?timeout, "Request timed out");
                Err(TransportError::Timeout {
                    port: reply_to,
                    after: timeout,
                })
            }
        }
    }

    fn open(&self, port: PortId) -> TransportResult<PortReader> {
        self.registry.open(port)
    }

    fn open_ephemeral(&self) -> PortReader {
        self.registry.open_ephemeral()
    }

    fn is_open(&self, port: PortId) -> bool {
        self.registry.is_open(port)
    }
}
