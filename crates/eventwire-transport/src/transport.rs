use crate::error::TransportResult;
use crate::event::{Event, TransportEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Capabilities a transport declares about itself.
///
/// The manager and middleware consult these instead of probing behavior:
/// a transport that reports `max_message_size == 0` accepts any size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Continuous delivery of events (vs. polling).
    pub streaming: bool,
    /// Full-duplex send and receive.
    pub bidirectional: bool,
    /// Multiple logical streams over one connection.
    pub multiplexing: bool,
    /// Payload compression on the wire.
    pub compression: bool,
    /// Maximum accepted message size in bytes; 0 means unlimited.
    pub max_message_size: usize,
    /// Transport-specific feature tags.
    pub features: Vec<String>,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            bidirectional: true,
            multiplexing: false,
            compression: false,
            max_message_size: 0,
            features: Vec::new(),
        }
    }
}

/// Point-in-time counters reported by [`Transport::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub connected_at: Option<SystemTime>,
}

/// The transport contract consumed by the manager.
///
/// A transport owns one wire connection (or an in-process equivalent) and
/// exposes its receive side as a pull stream: `receive` yields the next
/// envelope or `None` once the stream closes, which signals disconnection.
/// Asynchronous faults travel on a separate error stream so they never
/// entangle with `send` results.
///
/// `connect` and `close` are idempotent; `is_connected` is monotonic within
/// one connect/close cycle. No reconnection policy is imposed here; retry
/// belongs to the transport implementation or a middleware above it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stable identifier, stamped into delivered event metadata.
    fn id(&self) -> &str;

    /// Establishes the connection. A second call on a live connection
    /// may return `AlreadyConnected` or succeed idempotently.
    async fn connect(&self) -> TransportResult<()>;

    /// Tears the connection down and releases resources. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    /// Sends one event. Respects the connection state; callers race this
    /// against their cancellation token.
    async fn send(&self, event: &dyn TransportEvent) -> TransportResult<()>;

    /// Next incoming envelope; `None` once the stream is closed.
    async fn receive(&self) -> Option<Event>;

    /// Next asynchronous error; `None` once the error stream is closed.
    async fn next_error(&self) -> Option<crate::error::TransportError>;

    fn is_connected(&self) -> bool;

    fn capabilities(&self) -> TransportCapabilities;

    fn stats(&self) -> TransportStats;
}
