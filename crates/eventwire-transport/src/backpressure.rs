use crate::error::{BackpressureError, RingBufferError, TransportError};
use crate::event::Event;
use crate::ring_buffer::{OverflowPolicy, PushOutcome, RingBuffer};
use crate::utils::CancellationToken;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const ERROR_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// How the handler responds to a full buffer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackpressureStrategy {
    /// No backpressure: a full buffer rejects the newcomer, drop counted.
    None,
    /// Evict the oldest buffered event.
    DropOldest,
    /// Refuse the incoming event.
    DropNewest,
    /// Block the producer until space frees up.
    Block,
    /// Block, but give up with `BackpressureTimeout` after `block_timeout`.
    BlockWithTimeout,
}

/// Configuration for the backpressure handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub strategy: BackpressureStrategy,
    pub buffer_size: usize,
    /// Fill ratio at which `backpressure_active` flips on.
    pub high_water_mark: f64,
    /// Fill ratio at which `backpressure_active` clears again.
    pub low_water_mark: f64,
    /// Wait budget for `BlockWithTimeout`.
    pub block_timeout: Duration,
    pub enable_metrics: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            strategy: BackpressureStrategy::DropOldest,
            buffer_size: DEFAULT_BUFFER_SIZE,
            high_water_mark: 0.8,
            low_water_mark: 0.2,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            enable_metrics: true,
        }
    }
}

impl BackpressureConfig {
    /// Clamps the watermarks into `[0, 1]` and restores `low < high` when a
    /// caller hands in an inverted pair.
    fn normalized(mut self) -> Self {
        self.high_water_mark = self.high_water_mark.clamp(0.0, 1.0);
        self.low_water_mark = self.low_water_mark.clamp(0.0, 1.0);
        if self.low_water_mark >= self.high_water_mark {
            let fixed = self.high_water_mark / 2.0;
            tracing::warn!(
                low = self.low_water_mark,
                high = self.high_water_mark,
                clamped_low = fixed,
                "low water mark must stay below the high water mark"
            );
            self.low_water_mark = fixed;
        }
        self
    }
}

/// Snapshot of handler counters and watermark state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackpressureMetrics {
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub events_blocked: u64,
    pub errors_dropped: u64,
    pub current_buffer_size: usize,
    pub max_buffer_size: usize,
    pub high_water_mark_crossings: u64,
    pub low_water_mark_crossings: u64,
    pub backpressure_active: bool,
}

#[derive(Default)]
struct MetricsInner {
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    events_blocked: AtomicU64,
    errors_dropped: AtomicU64,
    high_crossings: AtomicU64,
    low_crossings: AtomicU64,
    active: AtomicBool,
}

/// Bounded queue between transport intake and consumer delivery.
///
/// Events live in a [`RingBuffer`]; the consumer stream pulls straight from
/// it, so nothing is prefetched and the configured overflow policy governs
/// exactly `buffer_size` in-flight events. Errors travel on a separate
/// bounded channel that is allowed to lose items; an error burst must never
/// backpressure the transport.
pub struct BackpressureHandler {
    config: BackpressureConfig,
    strategy: BackpressureStrategy,
    buffer: Arc<RingBuffer<Event>>,
    metrics: Arc<MetricsInner>,
    error_tx: Mutex<Option<mpsc::Sender<TransportError>>>,
    error_rx: Mutex<Option<mpsc::Receiver<TransportError>>>,
    stopped: AtomicBool,
}

impl BackpressureHandler {
    pub fn new(config: BackpressureConfig) -> Self {
        let config = config.normalized();

        // a zero-sized buffer can never free space, so blocking would be a
        // guaranteed deadlock
        let strategy = if config.buffer_size == 0
            && config.strategy == BackpressureStrategy::Block
        {
            tracing::warn!("buffer_size = 0 with Block strategy, treating as DropNewest");
            BackpressureStrategy::DropNewest
        } else {
            config.strategy
        };

        let policy = match strategy {
            BackpressureStrategy::DropOldest => OverflowPolicy::DropOldest,
            BackpressureStrategy::None | BackpressureStrategy::DropNewest => {
                OverflowPolicy::DropNewest
            }
            BackpressureStrategy::Block | BackpressureStrategy::BlockWithTimeout => {
                OverflowPolicy::Block
            }
        };

        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        Self {
            buffer: Arc::new(RingBuffer::new(config.buffer_size, policy)),
            strategy,
            config,
            metrics: Arc::new(MetricsInner::default()),
            error_tx: Mutex::new(Some(error_tx)),
            error_rx: Mutex::new(Some(error_rx)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Enqueues one event according to the configured strategy.
    ///
    /// Returns `Ok` for stored events and for policy-driven drops (drops are
    /// counted, not surfaced). Fails with `BackpressureTimeout` when a
    /// `BlockWithTimeout` wait exhausts its budget, and with
    /// `Stopped`/`Cancelled` when the handler shuts down or the caller's
    /// token fires mid-wait.
    pub async fn send_event(
        &self,
        event: Event,
        token: &CancellationToken,
    ) -> Result<(), BackpressureError> {
        if self.is_stopped() {
            return Err(BackpressureError::Stopped);
        }

        match self.strategy {
            BackpressureStrategy::None
            | BackpressureStrategy::DropOldest
            | BackpressureStrategy::DropNewest => {
                let outcome = self
                    .buffer
                    .try_push(event)
                    .map_err(Self::map_buffer_error)?;
                self.note_push_outcome(&outcome);
                Ok(())
            }
            BackpressureStrategy::Block => {
                let was_full = self.buffer.is_full();
                if was_full {
                    self.bump(&self.metrics.events_blocked, 1);
                }
                let outcome = self
                    .buffer
                    .push(event, token)
                    .await
                    .map_err(Self::map_buffer_error)?;
                if was_full {
                    self.debump(&self.metrics.events_blocked, 1);
                }
                self.note_push_outcome(&outcome);
                Ok(())
            }
            BackpressureStrategy::BlockWithTimeout => {
                let was_full = self.buffer.is_full();
                if was_full {
                    self.bump(&self.metrics.events_blocked, 1);
                }
                let waited = self.config.block_timeout;
                let outcome = match tokio::time::timeout(waited, self.buffer.push(event, token))
                    .await
                {
                    Ok(result) => result.map_err(Self::map_buffer_error)?,
                    // the wait is charged to events_blocked and stays charged
                    Err(_) => return Err(BackpressureError::Timeout { waited }),
                };
                if was_full {
                    self.debump(&self.metrics.events_blocked, 1);
                }
                self.note_push_outcome(&outcome);
                Ok(())
            }
        }
    }

    /// Best-effort error forwarding. A full channel discards the error so
    /// the transport's receive path can never deadlock on error reporting.
    pub fn send_error(&self, error: TransportError) {
        let guard = self.error_tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.bump(&self.metrics.errors_dropped, 1);
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(discarded)) = tx.try_send(error) {
            self.bump(&self.metrics.errors_dropped, 1);
            tracing::trace!(error = %discarded, "error channel full, discarding");
        }
    }

    /// Next buffered event, in arrival order. Waits while the buffer is
    /// empty; after [`stop`](Self::stop) keeps yielding until the buffer is
    /// drained, then returns `None` for good.
    pub async fn next_event(&self) -> Option<Event> {
        match self.buffer.pop_wait().await {
            Ok(event) => {
                self.bump(&self.metrics.events_delivered, 1);
                self.update_watermarks();
                Some(event)
            }
            Err(_) => None,
        }
    }

    /// Consumer-facing event stream, pulling straight from the buffer.
    pub fn event_stream(self: &Arc<Self>) -> Pin<Box<dyn Stream<Item = Event> + Send>> {
        let handler = Arc::clone(self);
        Box::pin(futures::stream::unfold(handler, |handler| async move {
            handler.next_event().await.map(|event| (event, handler))
        }))
    }

    /// Consumer-facing error stream. The receiver can be handed out once;
    /// later calls get a stream that is already closed.
    pub fn error_stream(&self) -> ReceiverStream<TransportError> {
        match self.error_rx.lock().take() {
            Some(rx) => ReceiverStream::new(rx),
            None => {
                tracing::warn!("error stream already taken, returning a closed stream");
                let (_, rx) = mpsc::channel(1);
                ReceiverStream::new(rx)
            }
        }
    }

    pub fn metrics(&self) -> BackpressureMetrics {
        BackpressureMetrics {
            events_delivered: self.metrics.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.metrics.events_dropped.load(Ordering::Relaxed),
            events_blocked: self.metrics.events_blocked.load(Ordering::Relaxed),
            errors_dropped: self.metrics.errors_dropped.load(Ordering::Relaxed),
            current_buffer_size: self.buffer.len(),
            max_buffer_size: self.config.buffer_size,
            high_water_mark_crossings: self.metrics.high_crossings.load(Ordering::Relaxed),
            low_water_mark_crossings: self.metrics.low_crossings.load(Ordering::Relaxed),
            backpressure_active: self.metrics.active.load(Ordering::Acquire),
        }
    }

    /// Stops the handler. Idempotent. Blocked producers are released with an
    /// error; the event stream drains buffered items and then ends; the
    /// error stream ends once drained.
    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.buffer.close();
        // dropping the sender lets the error receiver drain then close
        drop(self.error_tx.lock().take());
        tracing::debug!("backpressure handler stopped");
    }

    fn note_push_outcome(&self, outcome: &PushOutcome<Event>) {
        match outcome {
            PushOutcome::Stored | PushOutcome::Grew(_) => {}
            PushOutcome::Evicted(evicted) => {
                self.bump(&self.metrics.events_dropped, 1);
                tracing::trace!(event = evicted.id(), "evicted oldest buffered event");
            }
            PushOutcome::Rejected(rejected) => {
                self.bump(&self.metrics.events_dropped, 1);
                tracing::trace!(event = rejected.id(), "buffer full, rejected event");
            }
        }
        self.update_watermarks();
    }

    /// Watermark hysteresis: the active flag flips on at the high mark and
    /// off at the low mark, with no transitions in between.
    fn update_watermarks(&self) {
        let capacity = self.config.buffer_size;
        let fill = if capacity == 0 {
            1.0
        } else {
            self.buffer.len() as f64 / capacity as f64
        };

        if fill >= self.config.high_water_mark {
            if !self.metrics.active.swap(true, Ordering::AcqRel) {
                self.metrics.high_crossings.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fill, "backpressure active");
            }
        } else if fill <= self.config.low_water_mark
            && self.metrics.active.swap(false, Ordering::AcqRel)
        {
            self.metrics.low_crossings.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(fill, "backpressure cleared");
        }
    }

    fn map_buffer_error(error: RingBufferError) -> BackpressureError {
        match error {
            RingBufferError::Closed => BackpressureError::Stopped,
            RingBufferError::Cancelled => BackpressureError::Cancelled,
        }
    }

    fn bump(&self, counter: &AtomicU64, by: u64) {
        if self.config.enable_metrics {
            counter.fetch_add(by, Ordering::Relaxed);
        }
    }

    fn debump(&self, counter: &AtomicU64, by: u64) {
        if self.config.enable_metrics {
            counter.fetch_sub(by, Ordering::Relaxed);
        }
    }
}
