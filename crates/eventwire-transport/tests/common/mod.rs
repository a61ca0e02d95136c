#![allow(dead_code)]

use async_trait::async_trait;
use eventwire_transport::{
    Event, GenericEvent, Transport, TransportCapabilities, TransportError, TransportEvent,
    TransportResult, TransportStats,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Builds a delivered envelope the way a transport would.
pub fn envelope(id: &str, event_type: &str, transport: &str) -> Event {
    Event::new(
        Arc::new(GenericEvent::new(event_type).with_id(id)),
        transport,
    )
}

/// Test transport with a scriptable receive side and a recording send side.
///
/// `send` only records (nothing is echoed); the test drives the receive
/// stream by calling [`emit`](Self::emit), standing in for a remote peer.
pub struct ScriptedTransport {
    id: String,
    connected: AtomicBool,
    emit_tx: Mutex<Option<mpsc::Sender<Event>>>,
    emit_rx: AsyncMutex<Option<mpsc::Receiver<Event>>>,
    error_tx: Mutex<Option<mpsc::Sender<TransportError>>>,
    error_rx: AsyncMutex<Option<mpsc::Receiver<TransportError>>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn new(id: impl Into<String>) -> Self {
        let (emit_tx, emit_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(64);
        Self {
            id: id.into(),
            connected: AtomicBool::new(false),
            emit_tx: Mutex::new(Some(emit_tx)),
            emit_rx: AsyncMutex::new(Some(emit_rx)),
            error_tx: Mutex::new(Some(error_tx)),
            error_rx: AsyncMutex::new(Some(error_rx)),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Delivers an envelope on the receive stream, as a remote peer would.
    pub async fn emit(&self, event: Event) {
        let tx = self.emit_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            tx.send(event).await.expect("receive side should be open");
        }
    }

    pub async fn emit_simple(&self, id: &str, event_type: &str) {
        let transport = self.id.clone();
        self.emit(envelope(id, event_type, &transport)).await;
    }

    /// Delivers an error on the error stream.
    pub async fn emit_error(&self, error: TransportError) {
        let tx = self.error_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            tx.send(error).await.expect("error side should be open");
        }
    }

    /// `(id, event_type)` of every event handed to `send`, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Closes the receive stream, simulating a peer disconnect.
    pub fn disconnect_receive(&self) {
        drop(self.emit_tx.lock().unwrap().take());
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> TransportResult<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::Release);
        drop(self.emit_tx.lock().unwrap().take());
        drop(self.error_tx.lock().unwrap().take());
        Ok(())
    }

    async fn send(&self, event: &dyn TransportEvent) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .lock()
            .unwrap()
            .push((event.id().to_string(), event.event_type().to_string()));
        Ok(())
    }

    async fn receive(&self) -> Option<Event> {
        let mut guard = self.emit_rx.lock().await;
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
        TransportCapabilities::default()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.sent.lock().unwrap().len() as u64,
            ..TransportStats::default()
        }
    }
}

/// Transport whose `connect` fails a configured number of times before
/// succeeding. Receive and error streams stay silent.
pub struct FlakyTransport {
    id: String,
    failures_left: AtomicUsize,
    connected: AtomicBool,
}

impl FlakyTransport {
    pub fn failing(id: impl Into<String>, failures: usize) -> Self {
        Self {
            id: id.into(),
            failures_left: AtomicUsize::new(failures),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> TransportResult<()> {
        let left = self.failures_left.load(Ordering::Acquire);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::Release);
            return Err(TransportError::ConnectionFailed {
                endpoint: self.id.clone(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "scripted connect failure",
                )),
            });
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn send(&self, _event: &dyn TransportEvent) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn receive(&self) -> Option<Event> {
        std::future::pending().await
    }

    async fn next_error(&self) -> Option<TransportError> {
        std::future::pending().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::default()
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}
