//! # fleet-transport
//!
//! Point-to-point messaging between services and scripts.
//!
//! A port is a bounded FIFO of JSON frames addressed by [`PortId`]. One
//! reader owns each port; any number of writers may push to it. Writers get
//! try-write (fails when full) and blocking-write (waits for space).
//!
//! Every frame is a [`WireMessage`]: `[type, responsePort|null, payload]`.
//! [`Transport::request`] opens an ephemeral response port, writes the
//! request, and waits for one reply. When the caller gives up, the port is
//! closed, which services use to detect abandoned requests.

mod envelope;
mod error;
mod port;
mod transport;

pub use envelope::WireMessage;
pub use error::{TransportError, TransportResult};
pub use port::{PortReader, PortRegistry, PortWriter, DEFAULT_PORT_CAPACITY};
pub use transport::{PortTransport, Transport};

pub use fleet_id::PortId;
