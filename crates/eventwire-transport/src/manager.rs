use crate::backpressure::{BackpressureConfig, BackpressureHandler, BackpressureMetrics};
use crate::error::{BackpressureError, ErrorKind, TransportError, TransportResult};
use crate::event::{Event, TransportEvent};
use crate::transport::{Transport, TransportStats};
use crate::utils::{CancellationToken, CancellationTokenSource};
use crate::validation::{ValidationConfig, Validator};
use futures::future::join_all;
use futures::{FutureExt, Stream};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_SWAP_GRACE: Duration = Duration::from_millis(100);

/// Tuning knobs for the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Budget for pre-connecting a replacement transport during a swap.
    pub connect_timeout: Duration,
    /// How long `stop` waits for receive workers before proceeding anyway.
    pub stop_grace: Duration,
    /// Grace window between retiring a replaced transport's workers and
    /// closing it, letting in-flight operations finish.
    pub swap_grace: Duration,
    pub backpressure: BackpressureConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            swap_grace: DEFAULT_SWAP_GRACE,
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// A transport plus the stop signal scoped to its binding.
///
/// Each installed transport gets a fresh signal; retiring the binding cancels
/// the signal first, then closes the transport, in that order.
struct ActiveBinding {
    transport: Arc<dyn Transport>,
    stop: CancellationTokenSource,
    token: CancellationToken,
}

impl ActiveBinding {
    fn new(transport: Arc<dyn Transport>) -> Self {
        let (stop, token) = CancellationTokenSource::new();
        Self {
            transport,
            stop,
            token,
        }
    }
}

struct ManagerState {
    active: Option<ActiveBinding>,
    validator: Option<Arc<Validator>>,
    workers: Vec<JoinHandle<()>>,
}

/// Owns the current transport and presents a stable send/receive surface
/// while transports come, go, or get replaced.
///
/// Lifecycle transitions ride a compare-and-swap flag so that exactly one of
/// any number of concurrent `start` calls wins (the rest see
/// `AlreadyConnected`), and a failed connect resets the flag before the error
/// surfaces. All transport I/O happens outside the manager lock: the lock
/// only ever covers reference swaps and worker bookkeeping.
///
/// The consumer-visible [`receive`](Self::receive) and
/// [`errors`](Self::errors) streams are unified across transport swaps:
/// consumers never observe a swap as stream termination.
pub struct TransportManager {
    running: AtomicBool,
    state: Arc<RwLock<ManagerState>>,
    backpressure: Arc<BackpressureHandler>,
    stop_source: CancellationTokenSource,
    stop_token: CancellationToken,
    transport_ready: Notify,
    options: ManagerOptions,
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl TransportManager {
    pub fn new(options: ManagerOptions) -> Self {
        let (stop_source, stop_token) = CancellationTokenSource::new();
        Self {
            running: AtomicBool::new(false),
            state: Arc::new(RwLock::new(ManagerState {
                active: None,
                validator: None,
                workers: Vec::new(),
            })),
            backpressure: Arc::new(BackpressureHandler::new(options.backpressure.clone())),
            stop_source,
            stop_token,
            transport_ready: Notify::new(),
            options,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn has_transport(&self) -> bool {
        self.state.read().await.active.is_some()
    }

    /// Starts the manager: flips the lifecycle flag, connects the current
    /// transport (if any) and spawns its receive worker.
    ///
    /// Exactly one concurrent caller wins the 0→1 transition; the others get
    /// `AlreadyConnected` without touching the transport. A connect failure
    /// resets the flag to 0 before returning, so a later `start` can succeed.
    pub async fn start(&self, token: &CancellationToken) -> TransportResult<()> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TransportError::AlreadyConnected)?;

        let binding = {
            let state = self.state.read().await;
            state
                .active
                .as_ref()
                .map(|b| (Arc::clone(&b.transport), b.token.clone()))
        };

        if let Some((transport, binding_token)) = binding {
            let connected = tokio::select! {
                result = transport.connect() => result,
                _ = token.cancelled() => Err(TransportError::Cancelled),
            };
            if let Err(error) = connected {
                // fail-safe reset: leave the manager startable again
                self.running.store(false, Ordering::Release);
                tracing::warn!(transport = transport.id(), error = %error, "connect failed during start");
                return Err(error);
            }

            let mut state = self.state.write().await;
            self.spawn_worker_locked(&mut state, transport, binding_token);
        }

        tracing::debug!("transport manager started");
        Ok(())
    }

    /// Stops the manager and tears the current binding down.
    ///
    /// Idempotent: only the caller that wins the 1→0 transition performs
    /// teardown, everyone else returns `Ok`. Workers get a bounded grace to
    /// exit; exhausting it is logged and swallowed, never surfaced. A
    /// `Timeout` from the transport's close is swallowed too; any other
    /// close error is the one thing `stop` reports.
    ///
    /// A stopped manager is terminal: the consumer streams drain and end,
    /// and the instance is not restartable.
    pub async fn stop(&self, token: &CancellationToken) -> TransportResult<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.stop_source.cancel();

        let (workers, active) = {
            let mut state = self.state.write().await;
            (std::mem::take(&mut state.workers), state.active.take())
        };

        if let Some(binding) = &active {
            binding.stop.cancel();
        }

        if !workers.is_empty() {
            let joined = tokio::select! {
                result = tokio::time::timeout(self.options.stop_grace, join_all(workers)) => result.is_ok(),
                _ = token.cancelled() => false,
            };
            if !joined {
                tracing::warn!(
                    grace = ?self.options.stop_grace,
                    "receive workers did not exit within the stop grace, proceeding"
                );
            }
        }

        let mut close_result = Ok(());
        if let Some(binding) = active {
            match tokio::time::timeout(self.options.stop_grace, binding.transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) if error.is(ErrorKind::Timeout) => {
                    tracing::warn!(error = %error, "transport close timed out, proceeding");
                }
                Ok(Err(error)) => close_result = Err(error),
                Err(_) => {
                    tracing::warn!("transport close exceeded the stop grace, proceeding");
                }
            }
        }

        self.backpressure.stop();
        tracing::debug!("transport manager stopped");
        close_result
    }

    /// Installs (or clears) the active transport, swapping live if the
    /// manager is running. Never fails; a replacement that cannot
    /// pre-connect is still installed and logged.
    ///
    /// The swap itself holds the lock only for reference surgery. The old
    /// binding is retired off the hot path: its stop signal fires first, a
    /// short grace lets in-flight operations finish, then the transport is
    /// closed. Pre-connecting the newcomer before the swap keeps the gap
    /// between old-close and new-serve small.
    pub async fn set_transport(&self, transport: Option<Arc<dyn Transport>>) {
        if let Some(transport) = &transport {
            if self.is_running() && !transport.is_connected() {
                match tokio::time::timeout(self.options.connect_timeout, transport.connect()).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::warn!(transport = transport.id(), error = %error, "pre-connect of replacement transport failed");
                    }
                    Err(_) => {
                        tracing::warn!(transport = transport.id(), "pre-connect of replacement transport timed out");
                    }
                }
            }
        }

        let old = {
            let mut state = self.state.write().await;
            let old = state.active.take();
            if let Some(transport) = transport {
                let binding = ActiveBinding::new(Arc::clone(&transport));
                let binding_token = binding.token.clone();
                state.active = Some(binding);
                if self.is_running() && transport.is_connected() {
                    self.spawn_worker_locked(&mut state, transport, binding_token);
                }
            }
            old
        };

        // level trigger: a permit is stored if nobody is waiting yet
        self.transport_ready.notify_one();

        if let Some(old) = old {
            let grace = self.options.swap_grace;
            tokio::spawn(async move {
                old.stop.cancel();
                tokio::time::sleep(grace).await;
                if let Err(error) = old.transport.close().await {
                    tracing::warn!(transport = old.transport.id(), error = %error, "failed to close replaced transport");
                }
            });
        }
    }

    /// Waits until a transport has been installed (or re-installed).
    pub async fn transport_installed(&self) {
        self.transport_ready.notified().await;
    }

    /// Validates (when enabled) and sends one event over the active
    /// transport. Validation failure means the transport was never invoked.
    pub async fn send(
        &self,
        token: &CancellationToken,
        event: &dyn TransportEvent,
    ) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::NotConnected);
        }

        let (transport, validator) = {
            let state = self.state.read().await;
            (
                state.active.as_ref().map(|b| Arc::clone(&b.transport)),
                state.validator.clone(),
            )
        };

        let Some(transport) = transport else {
            return Err(TransportError::NotConnected);
        };
        if !transport.is_connected() {
            return Err(TransportError::NotConnected);
        }

        if let Some(validator) = validator {
            if validator.is_enabled() {
                validator.validate_outgoing(event)?;
            }
        }

        tokio::select! {
            result = transport.send(event) => result,
            _ = token.cancelled() => Err(TransportError::Cancelled),
        }
    }

    /// Consumer-facing stream of delivered envelopes. Unified across
    /// transport swaps; ends only after `stop` (draining buffered events
    /// first). Single-consumer: pulls straight from the backpressure buffer.
    pub fn receive(&self) -> Pin<Box<dyn Stream<Item = Event> + Send>> {
        self.backpressure.event_stream()
    }

    /// Consumer-facing stream of asynchronous errors. The underlying
    /// receiver is handed out once; ends only after `stop`.
    pub fn errors(&self) -> ReceiverStream<TransportError> {
        self.backpressure.error_stream()
    }

    /// Installs a validation configuration, or clears it with `None`.
    ///
    /// The config and its compiled validator are swapped in as a single
    /// value, so concurrent senders and receive workers always observe a
    /// matching pair. A config that fails to compile leaves the previous
    /// pair in place.
    pub async fn set_validation_config(
        &self,
        config: Option<ValidationConfig>,
    ) -> TransportResult<()> {
        let next = match config {
            Some(config) => Some(Arc::new(Validator::new(config)?)),
            None => None,
        };
        self.state.write().await.validator = next;
        Ok(())
    }

    pub fn backpressure_metrics(&self) -> BackpressureMetrics {
        self.backpressure.metrics()
    }

    /// Stats of the active transport, if one is installed.
    pub async fn transport_stats(&self) -> Option<TransportStats> {
        self.state
            .read()
            .await
            .active
            .as_ref()
            .map(|b| b.transport.stats())
    }

    /// Spawns the receive worker for one transport binding and registers its
    /// handle, both under the lock already held by the caller.
    fn spawn_worker_locked(
        &self,
        state: &mut ManagerState,
        transport: Arc<dyn Transport>,
        binding_token: CancellationToken,
    ) {
        let worker = receive_loop(
            Arc::clone(&transport),
            Arc::clone(&self.state),
            Arc::clone(&self.backpressure),
            self.stop_token.clone(),
            binding_token,
        );
        let backpressure = Arc::clone(&self.backpressure);
        let transport_id = transport.id().to_string();
        let handle = tokio::spawn(async move {
            // a worker failure takes down that worker only
            if AssertUnwindSafe(worker).catch_unwind().await.is_err() {
                tracing::error!(transport = %transport_id, "receive worker panicked");
                backpressure.send_error(TransportError::Internal(format!(
                    "receive worker for transport '{transport_id}' panicked"
                )));
            }
        });
        state.workers.push(handle);
    }
}

/// Receive loop for one transport binding.
///
/// Selects over the manager-wide stop signal, the binding's stop signal, the
/// transport's event stream, and its error stream. Incoming events are
/// annotated by the current validator (fetched fresh per event under a read
/// lock, run outside it) and forwarded to the backpressure handler; policy
/// drops are counted there and never block this loop under the non-blocking
/// strategies. A closed event stream emits `ConnectionClosed` and ends the
/// binding; a closed error stream only disables that select arm.
async fn receive_loop(
    transport: Arc<dyn Transport>,
    state: Arc<RwLock<ManagerState>>,
    backpressure: Arc<BackpressureHandler>,
    manager_stop: CancellationToken,
    binding_stop: CancellationToken,
) {
    let mut errors_open = true;
    loop {
        tokio::select! {
            _ = manager_stop.cancelled() => break,
            _ = binding_stop.cancelled() => break,
            received = transport.receive() => match received {
                Some(mut envelope) => {
                    let validator = { state.read().await.validator.clone() };
                    if let Some(validator) = validator {
                        if validator.is_enabled() {
                            let result = validator.validate_incoming(&envelope);
                            envelope.stamp_validation(&result);
                        }
                    }
                    if envelope.metadata.transport.is_empty() {
                        envelope.metadata.transport = transport.id().to_string();
                    }
                    match backpressure.send_event(envelope, &binding_stop).await {
                        Ok(()) => {}
                        Err(BackpressureError::Timeout { waited }) => {
                            tracing::debug!(transport = transport.id(), ?waited, "event dropped after backpressure timeout");
                        }
                        Err(_) => break,
                    }
                }
                None => {
                    backpressure.send_error(TransportError::ConnectionClosed);
                    break;
                }
            },
            next = transport.next_error(), if errors_open => match next {
                Some(error) => backpressure.send_error(error),
                None => errors_open = false,
            },
        }
    }
    tracing::trace!(transport = transport.id(), "receive worker exited");
}
