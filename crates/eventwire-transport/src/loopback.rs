use crate::error::{TransportError, TransportResult};
use crate::event::{Event, GenericEvent, TransportEvent};
use crate::transport::{Transport, TransportCapabilities, TransportStats};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{mpsc, Mutex};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct StatsInner {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
}

/// In-process transport that echoes every sent event back onto its own
/// receive stream.
///
/// The crate's one concrete transport: no wire, no reconnect policy, just
/// the full contract: idempotent connect/close, a pull-based receive side,
/// a separate error stream, and honest stats accounting. The demos and the
/// integration tests run against it, and new transport implementations can
/// crib its shape.
pub struct LoopbackTransport {
    id: String,
    capacity: usize,
    connected: AtomicBool,
    event_tx: SyncMutex<Option<mpsc::Sender<Event>>>,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    error_tx: SyncMutex<Option<mpsc::Sender<TransportError>>>,
    error_rx: Mutex<Option<mpsc::Receiver<TransportError>>>,
    stats: StatsInner,
    connected_at: SyncMutex<Option<SystemTime>>,
}

impl LoopbackTransport {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_capacity(id, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity: capacity.max(1),
            connected: AtomicBool::new(false),
            event_tx: SyncMutex::new(None),
            event_rx: Mutex::new(None),
            error_tx: SyncMutex::new(None),
            error_rx: Mutex::new(None),
            stats: StatsInner::default(),
            connected_at: SyncMutex::new(None),
        }
    }

    /// Pushes an error onto the asynchronous error stream, as a real
    /// transport would when the wire misbehaves.
    pub async fn inject_error(&self, error: TransportError) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        let tx = self.error_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(error).await;
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> TransportResult<()> {
        if self.connected.swap(true, Ordering::AcqRel) {
            // idempotent: already connected is success
            return Ok(());
        }
        let (event_tx, event_rx) = mpsc::channel(self.capacity);
        let (error_tx, error_rx) = mpsc::channel(self.capacity);
        *self.event_tx.lock() = Some(event_tx);
        *self.event_rx.lock().await = Some(event_rx);
        *self.error_tx.lock() = Some(error_tx);
        *self.error_rx.lock().await = Some(error_rx);
        *self.connected_at.lock() = Some(SystemTime::now());
        tracing::debug!(transport = %self.id, "loopback connected");
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // dropping the senders closes the receive side after it drains
        drop(self.event_tx.lock().take());
        drop(self.error_tx.lock().take());
        *self.connected_at.lock() = None;
        tracing::debug!(transport = %self.id, "loopback closed");
        Ok(())
    }

    async fn send(&self, event: &dyn TransportEvent) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let tx = self
            .event_tx
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let size = event.serialized_size();
        let echo = GenericEvent {
            id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            timestamp: event.timestamp(),
            payload: event.payload().clone(),
        };
        let envelope = Event::new(std::sync::Arc::new(echo), self.id.clone());

        tx.send(envelope).await.map_err(|_| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })?;

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self) -> Option<Event> {
        let mut guard = self.event_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn next_error(&self) -> Option<TransportError> {
        let mut guard = self.error_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            bidirectional: true,
            multiplexing: false,
            compression: false,
            max_message_size: 0,
            features: vec!["loopback".to_string()],
        }
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            connected_at: *self.connected_at.lock(),
        }
    }
}
