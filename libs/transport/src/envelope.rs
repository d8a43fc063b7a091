//! The wire envelope.

use fleet_id::PortId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportResult;

/// One frame on a port.
///
/// Serialized as a three element JSON array so that frames stay compatible
/// with scripts that only know the positional layout:
///
/// ```text
/// [type, responsePort | null, payload]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireTuple", into = "WireTuple")]
pub struct WireMessage {
    /// Message type tag; meaning is owned by the protocol layer.
    pub tag: u16,
    /// Where the reply goes, if one is expected.
    pub response_port: Option<PortId>,
    pub payload: Value,
}

#[derive(Serialize, Deserialize)]
struct WireTuple(u16, Option<PortId>, Value);

impl From<WireTuple> for WireMessage {
    fn from(WireTuple(tag, response_port, payload): WireTuple) -> Self {
        Self {
            tag,
            response_port,
            payload,
        }
    }
}

impl From<WireMessage> for WireTuple {
    fn from(message: WireMessage) -> Self {
        WireTuple(message.tag, message.response_port, message.payload)
    }
}

impl WireMessage {
    /// A fire-and-forget frame.
    pub fn new(tag: u16, payload: Value) -> Self {
        Self {
            tag,
            response_port: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_response_port(mut self, port: PortId) -> Self {
        self.response_port = Some(port);
        self
    }

    pub fn encode(&self) -> TransportResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> TransportResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}
