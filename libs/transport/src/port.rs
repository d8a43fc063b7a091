//! Bounded ports and the registry that addresses them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleet_id::PortId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::envelope::WireMessage;
use crate::error::{TransportError, TransportResult};

/// Frames a port holds before writers see [`TransportError::Full`].
pub const DEFAULT_PORT_CAPACITY: usize = 50;

#[derive(Debug)]
struct PortEntry {
    generation: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Debug)]
struct Inner {
    ports: Mutex<HashMap<PortId, PortEntry>>,
    next_ephemeral: AtomicU32,
    next_generation: AtomicU64,
    capacity: usize,
}

impl Inner {
    fn ports(&self) -> MutexGuard<'_, HashMap<PortId, PortEntry>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared table of open ports.
///
/// Cheap to clone; every clone addresses the same ports.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    inner: Arc<Inner>,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_CAPACITY)
    }
}

impl PortRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                ports: Mutex::new(HashMap::new()),
                next_ephemeral: AtomicU32::new(PortId::EPHEMERAL_START.value()),
                next_generation: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Opens `port` for reading. Fails if it already has a live reader.
    pub fn open(&self, port: PortId) -> TransportResult<PortReader> {
        let mut ports = self.inner.ports();
        if let Some(entry) = ports.get(&port) {
            if !entry.tx.is_closed() {
                return Err(TransportError::PortInUse(port));
            }
        }
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        ports.insert(port, PortEntry { generation, tx });
        debug!(%port, "Opened port");

        Ok(PortReader {
            port,
            generation,
            rx,
            registry: Arc::clone(&self.inner),
        })
    }

    /// Opens the next free port in the ephemeral range.
    pub fn open_ephemeral(&self) -> PortReader {
        loop {
            let raw = self.inner.next_ephemeral.fetch_add(1, Ordering::Relaxed);
            let port = PortId::new(raw.max(PortId::EPHEMERAL_START.value()));
            if let Ok(reader) = self.open(port) {
                return reader;
            }
        }
    }

    /// A writer for `port`, if someone reads it.
    pub fn writer(&self, port: PortId) -> TransportResult<PortWriter> {
        let ports = self.inner.ports();
        match ports.get(&port) {
            Some(entry) if !entry.tx.is_closed() => Ok(PortWriter {
                port,
                tx: entry.tx.clone(),
            }),
            _ => Err(TransportError::Closed(port)),
        }
    }

    /// Whether `port` has a live reader.
    pub fn is_open(&self, port: PortId) -> bool {
        self.inner
            .ports()
            .get(&port)
            .map(|entry| !entry.tx.is_closed())
            .unwrap_or(false)
    }

    /// Frames waiting on `port`.
    pub fn queued(&self, port: PortId) -> usize {
        self.inner
            .ports()
            .get(&port)
            .map(|entry| entry.tx.max_capacity() - entry.tx.capacity())
            .unwrap_or(0)
    }
}

/// The reading end of a port. Dropping it closes the port.
#[derive(Debug)]
pub struct PortReader {
    port: PortId,
    generation: u64,
    rx: mpsc::Receiver<String>,
    registry: Arc<Inner>,
}

impl PortReader {
    pub fn port(&self) -> PortId {
        self.port
    }

    /// Waits for the next raw frame.
    pub async fn read_frame(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Waits for the next frame and decodes it.
    ///
    /// `None` once the port is closed and drained.
    pub async fn read(&mut self) -> Option<TransportResult<WireMessage>> {
        let frame = self.rx.recv().await?;
        trace!(port = %self.port, %frame, "Read frame");
        Some(WireMessage::decode(&frame))
    }

    /// Like [`read`](Self::read) with a deadline.
    pub async fn read_timeout(&mut self, after: Duration) -> TransportResult<WireMessage> {
        match tokio::time::timeout(after, self.rx.recv()).await {
            Ok(Some(frame)) => WireMessage::decode(&frame),
            Ok(None) => Err(TransportError::Closed(self.port)),
            Err(_) => Err(TransportError::Timeout {
                port: self.port,
                after,
            }),
        }
    }

    /// Pops a frame if one is queued.
    pub fn try_read(&mut self) -> Option<TransportResult<WireMessage>> {
        self.rx.try_recv().ok().map(|frame| WireMessage::decode(&frame))
    }

    /// Closes the port. Queued frames can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
        self.unregister();
    }

    fn unregister(&self) {
        let mut ports = self.registry.ports();
        if ports
            .get(&self.port)
            .map(|entry| entry.generation == self.generation)
            .unwrap_or(false)
        {
            ports.remove(&self.port);
            debug!(port = %self.port, "Closed port");
        }
    }
}

impl Drop for PortReader {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// A handle for pushing frames to one port.
#[derive(Debug, Clone)]
pub struct PortWriter {
    port: PortId,
    tx: mpsc::Sender<String>,
}

impl PortWriter {
    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Writes without waiting; fails if the queue is full.
    pub fn try_write(&self, message: &WireMessage) -> TransportResult<()> {
        let frame = message.encode()?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full(self.port),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(self.port),
        })
    }

    /// Writes, waiting for space if the queue is full.
    pub async fn write(&self, message: &WireMessage) -> TransportResult<()> {
        let frame = message.encode()?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed(self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(tag: u16) -> WireMessage {
        WireMessage::new(tag, json!(tag))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let registry = PortRegistry::default();
        let mut reader = registry.open(PortId::new(5)).unwrap();
        let writer = registry.writer(PortId::new(5)).unwrap();

        for tag in 1..=3 {
            writer.write(&msg(tag)).await.unwrap();
        }
        for tag in 1..=3 {
            assert_eq!(reader.read().await.unwrap().unwrap().tag, tag);
        }
    }

    #[tokio::test]
    async fn test_try_write_full() {
        let registry = PortRegistry::new(2);
        let _reader = registry.open(PortId::new(5)).unwrap();
        let writer = registry.writer(PortId::new(5)).unwrap();

        writer.try_write(&msg(1)).unwrap();
        writer.try_write(&msg(2)).unwrap();
        assert_eq!(
            writer.try_write(&msg(3)).unwrap_err(),
            TransportError::Full(PortId::new(5))
        );
        assert_eq!(registry.queued(PortId::new(5)), 2);
    }

    #[tokio::test]
    async fn test_blocking_write_waits_for_space() {
        let registry = PortRegistry::new(1);
        let mut reader = registry.open(PortId::new(5)).unwrap();
        let writer = registry.writer(PortId::new(5)).unwrap();
        writer.try_write(&msg(1)).unwrap();

        let pending = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write(&msg(2)).await }
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(reader.read().await.unwrap().unwrap().tag, 1);
        pending.await.unwrap().unwrap();
        assert_eq!(reader.read().await.unwrap().unwrap().tag, 2);
    }

    #[tokio::test]
    async fn test_dropping_reader_closes_port() {
        let registry = PortRegistry::default();
        let reader = registry.open(PortId::new(9)).unwrap();
        let writer = registry.writer(PortId::new(9)).unwrap();
        assert!(registry.is_open(PortId::new(9)));
        assert!(registry.open(PortId::new(9)).is_err());

        drop(reader);
        assert!(!registry.is_open(PortId::new(9)));
        assert!(writer.try_write(&msg(1)).unwrap_err().is_closed());
        assert!(registry.writer(PortId::new(9)).unwrap_err().is_closed());

        // The port number can be reused.
        let _reader = registry.open(PortId::new(9)).unwrap();
        assert!(registry.is_open(PortId::new(9)));
    }

    #[tokio::test]
    async fn test_ephemeral_ports_are_distinct() {
        let registry = PortRegistry::default();
        let a = registry.open_ephemeral();
        let b = registry.open_ephemeral();
        assert_ne!(a.port(), b.port());
        assert!(a.port().is_ephemeral());
        assert!(b.port().is_ephemeral());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let registry = PortRegistry::default();
        let mut reader = registry.open(PortId::new(4)).unwrap();
        let err = reader
            .read_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
