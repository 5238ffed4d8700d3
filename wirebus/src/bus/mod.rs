//! The messaging engine.
//!
//! [`MessageBus`] is the application-facing façade: typed send, subscribe,
//! request/reply, and handler registration over whatever transports the
//! injected [`TransportManager`] provides. A bus is a cheap clone over
//! shared state and can be used from any number of tasks concurrently.
//!
//! Lifecycle: **active → closing → closed**. Every public operation checks
//! the closing flag up front; [`shutdown`](MessageBus::shutdown) then fails
//! outstanding requests, flushes deferred acknowledgements, waits for
//! in-flight operations, and tears down registrations oldest-first before
//! closing the transports.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::contract::{Contract, KnownTypes, TypeNames};
use crate::transport::{
    InboundFn, ProcessingGroup, RawAck, RequestHandle, ResponseFn, Teardown, TransportEvent,
    TransportEventKind, TransportManager, WireHandlerFn,
};
use crate::{BinaryMessage, BoxError, Endpoint, EngineConfig, EngineError};

mod ack;
mod gate;
mod registry;
mod tracker;
mod util;

pub use ack::Ack;
pub use registry::Registration;

use ack::DeferredAckScheduler;
use gate::OperationGate;
use registry::HandleRegistry;
use tracker::RequestTracker;
use util::{panic_message, Stopper};

/// The broker-client façade. See the [module docs](self) for an overview.
///
/// Construction spawns the engine's background workers, so a `MessageBus`
/// must be created inside a tokio runtime.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusShared>,
}

struct BusShared {
    transports: Arc<dyn TransportManager>,
    config: EngineConfig,
    stopper: Stopper,
    names: TypeNames,
    acks: Arc<DeferredAckScheduler>,
    tracker: Arc<RequestTracker>,
    gate: Arc<OperationGate>,
    registry: Arc<HandleRegistry>,
}

impl Drop for BusShared {
    fn drop(&mut self) {
        // Lets the background workers exit if the bus is dropped without an
        // orderly shutdown.
        self.stopper.stop();
    }
}

impl core::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBus")
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

/// # Construction and lifecycle
impl MessageBus {
    pub fn new(transports: Arc<dyn TransportManager>) -> Self {
        Self::with_config(transports, EngineConfig::default())
    }

    pub fn with_config(transports: Arc<dyn TransportManager>, config: EngineConfig) -> Self {
        let stopper = Stopper::new();
        let acks = DeferredAckScheduler::spawn(stopper.clone());
        let tracker = RequestTracker::spawn(stopper.clone());
        Self {
            inner: Arc::new(BusShared {
                transports,
                config,
                stopper,
                names: TypeNames::new(),
                acks,
                tracker,
                gate: Arc::new(OperationGate::new()),
                registry: Arc::new(HandleRegistry::new()),
            }),
        }
    }

    /// True once shutdown has begun. New operations fail with
    /// [`EngineError::ShuttingDown`] from that point on.
    pub fn is_closing(&self) -> bool {
        self.inner.stopper.is_stopped()
    }

    /// Resolves when shutdown begins (on any clone of this bus).
    pub async fn wait_closed(&self) {
        self.inner.stopper.wait_stopped().await;
    }

    /// Shuts the engine down, draining in-flight work.
    ///
    /// Order matters: outstanding requests are failed first so waiting
    /// callers unblock, deferred acknowledgements are flushed so none are
    /// lost, then the engine waits for operations to leave their tracked
    /// regions before tearing down registrations (oldest first) and closing
    /// the transports. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.stopper.stop();
        self.inner.tracker.stop_all();
        self.inner.acks.force_drain();
        self.inner.gate.wait_idle().await;
        self.inner.registry.dispose_all();
        self.inner.transports.close().await;
    }

    /// Requests currently awaiting a response or their deadline.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Operations currently inside a tracked region.
    pub fn tracked_operations(&self) -> usize {
        self.inner.gate.in_flight()
    }

    /// Live subscription and handler registrations.
    pub fn open_handles(&self) -> usize {
        self.inner.registry.len()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.inner.stopper.is_stopped() {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn ensure_destination(endpoint: &Endpoint) -> Result<(), EngineError> {
        if endpoint.destination().is_empty() {
            Err(EngineError::Argument("endpoint destination must not be empty"))
        } else {
            Ok(())
        }
    }

    fn group(&self, endpoint: &Endpoint) -> Result<Arc<dyn ProcessingGroup>, EngineError> {
        self.inner
            .transports
            .processing_group(endpoint.transport_id(), endpoint.destination())
            .map_err(|source| transport_error(endpoint, source))
    }
}

/// # Send
impl MessageBus {
    /// Publishes `message` with the configured default lifespan.
    pub async fn send<T>(&self, message: &T, endpoint: &Endpoint) -> Result<(), EngineError>
    where
        T: Contract + Serialize,
    {
        self.send_with_lifespan(message, endpoint, self.inner.config.message_lifespan)
            .await
    }

    /// Publishes `message`, expiring it at the broker after `lifespan`
    /// (zero means never).
    pub async fn send_with_lifespan<T>(
        &self,
        message: &T,
        endpoint: &Endpoint,
        lifespan: Duration,
    ) -> Result<(), EngineError>
    where
        T: Contract + Serialize,
    {
        Self::ensure_destination(endpoint)?;
        self.ensure_open()?;
        let _region = self.inner.gate.track();

        let wire_type = self.inner.names.resolve::<T>();
        let bytes = endpoint.format().to_bytes(message)?;
        let frame = BinaryMessage {
            bytes,
            wire_type: wire_type.to_string(),
        };
        self.dispatch_frame(frame, endpoint, lifespan).await
    }

    /// Publishes a pre-encoded frame. This is the escape hatch for
    /// polymorphic payloads or payloads produced elsewhere.
    pub async fn send_raw(
        &self,
        frame: BinaryMessage,
        endpoint: &Endpoint,
        lifespan: Duration,
    ) -> Result<(), EngineError> {
        Self::ensure_destination(endpoint)?;
        self.ensure_open()?;
        let _region = self.inner.gate.track();
        self.dispatch_frame(frame, endpoint, lifespan).await
    }

    async fn dispatch_frame(
        &self,
        frame: BinaryMessage,
        endpoint: &Endpoint,
        lifespan: Duration,
    ) -> Result<(), EngineError> {
        let group = self.group(endpoint)?;
        group
            .send(endpoint.destination(), frame, lifespan)
            .await
            .map_err(|source| transport_error(endpoint, source))
    }
}

/// # Subscribe
impl MessageBus {
    /// Subscribes with automatic acknowledgement: a callback returning
    /// `Ok(())` commits the message immediately; an `Err` (or panic) logs
    /// and rejects it with the configured redelivery delay.
    pub async fn subscribe<T, F>(
        &self,
        endpoint: &Endpoint,
        callback: F,
    ) -> Result<Registration, EngineError>
    where
        T: Contract + DeserializeOwned + Send + 'static,
        F: Fn(T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.subscribe_with_ack(endpoint, move |message: T, ack: Ack| {
            callback(message)?;
            ack.settle(Duration::ZERO, true);
            Ok(())
        })
        .await
    }

    /// Subscribes with explicit acknowledgement control. The callback owns
    /// the [`Ack`]; if it returns `Err` (or panics) without settling, the
    /// engine rejects the message with the configured redelivery delay.
    pub async fn subscribe_with_ack<T, F>(
        &self,
        endpoint: &Endpoint,
        callback: F,
    ) -> Result<Registration, EngineError>
    where
        T: Contract + DeserializeOwned + Send + 'static,
        F: Fn(T, Ack) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::ensure_destination(endpoint)?;
        self.ensure_open()?;
        let _region = self.inner.gate.track();

        let group = self.group(endpoint)?;
        let wire_type = self.inner.names.resolve::<T>();
        let filter = endpoint
            .shared_destination()
            .then(|| wire_type.to_string());
        let format = endpoint.format();
        let scheduler = self.inner.acks.clone();
        let unack_delay = self.inner.config.unack_delay;

        let on_message: InboundFn = Arc::new(move |frame: BinaryMessage, raw: RawAck| {
            let ack = Ack::new(raw, scheduler.clone());
            let message: T = match format.from_bytes(&frame.bytes) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(
                        wire_type = %frame.wire_type,
                        error = %error,
                        "failed to decode inbound message"
                    );
                    ack.settle(unack_delay, false);
                    return;
                }
            };
            let callback_ack = ack.clone();
            run_guarded(&ack, unack_delay, || callback(message, callback_ack));
        });

        let subscription = group
            .subscribe(endpoint.destination(), on_message, filter)
            .await
            .map_err(|source| transport_error(endpoint, source))?;
        Ok(self
            .inner
            .registry
            .create(Box::new(move || subscription.dispose())))
    }

    /// Subscribes to a destination carrying several schemas. Frames whose
    /// wire type appears in `known` are decoded and passed to `callback` as
    /// `Box<dyn Any + Send>`; anything else goes to `on_unknown`, which
    /// owns the acknowledgement for those frames.
    pub async fn subscribe_multi<F, U>(
        &self,
        endpoint: &Endpoint,
        known: KnownTypes,
        callback: F,
        on_unknown: U,
    ) -> Result<Registration, EngineError>
    where
        F: Fn(Box<dyn Any + Send>, Ack) -> Result<(), BoxError> + Send + Sync + 'static,
        U: Fn(&str, Ack) + Send + Sync + 'static,
    {
        Self::ensure_destination(endpoint)?;
        self.ensure_open()?;
        let _region = self.inner.gate.track();

        let group = self.group(endpoint)?;
        let format = endpoint.format();
        let scheduler = self.inner.acks.clone();
        let unack_delay = self.inner.config.unack_delay;

        let on_message: InboundFn = Arc::new(move |frame: BinaryMessage, raw: RawAck| {
            let ack = Ack::new(raw, scheduler.clone());
            let Some(decode) = known.decoder(&frame.wire_type) else {
                let unknown_ack = ack.clone();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| {
                    on_unknown(&frame.wire_type, unknown_ack)
                })) {
                    tracing::warn!(
                        wire_type = %frame.wire_type,
                        panic = panic_message(payload.as_ref()),
                        "unknown-type callback panicked"
                    );
                }
                return;
            };
            let message = match decode(format, &frame.bytes) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(
                        wire_type = %frame.wire_type,
                        error = %error,
                        "failed to decode inbound message"
                    );
                    ack.settle(unack_delay, false);
                    return;
                }
            };
            let callback_ack = ack.clone();
            run_guarded(&ack, unack_delay, || callback(message, callback_ack));
        });

        let subscription = group
            .subscribe(endpoint.destination(), on_message, None)
            .await
            .map_err(|source| transport_error(endpoint, source))?;
        Ok(self
            .inner
            .registry
            .create(Box::new(move || subscription.dispose())))
    }
}

/// # Request/reply
impl MessageBus {
    /// Sends a request and waits for the first response, the deadline, or
    /// shutdown, whichever comes first. On fan-out destinations only the
    /// first response is returned; the correlator is closed immediately so
    /// later responses are dropped.
    pub async fn send_request<Req, Resp>(
        &self,
        request: &Req,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Resp, EngineError>
    where
        Req: Contract + Serialize,
        Resp: Contract + DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<Resp, EngineError>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let respond_tx = tx.clone();
        let fail_tx = tx;

        let handle = self
            .send_request_with_callbacks(
                request,
                endpoint,
                move |response: Resp| {
                    if let Some(tx) = respond_tx.lock().expect("reply slot poisoned").take() {
                        let _ = tx.send(Ok(response));
                    }
                },
                move |error| {
                    if let Some(tx) = fail_tx.lock().expect("reply slot poisoned").take() {
                        let _ = tx.send(Err(error));
                    }
                },
                timeout,
            )
            .await?;

        let outcome = tokio::select! {
            biased;
            _ = self.inner.stopper.wait_stopped() => Err(EngineError::ShuttingDown),
            received = rx => match received {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::ShuttingDown),
            },
        };
        handle.dispose();
        outcome
    }

    /// Sends a request and delivers the outcome through callbacks: exactly
    /// one of `on_response` (decoded reply) or `on_failure` (processing
    /// failure, timeout, or shutdown) fires. The returned handle is the
    /// teardown; disposing it closes the transport-side correlator.
    pub async fn send_request_with_callbacks<Req, Resp, R, E>(
        &self,
        request: &Req,
        endpoint: &Endpoint,
        on_response: R,
        on_failure: E,
        timeout: Duration,
    ) -> Result<RequestHandle, EngineError>
    where
        Req: Contract + Serialize,
        Resp: Contract + DeserializeOwned + Send + 'static,
        R: FnOnce(Resp) + Send + 'static,
        E: FnOnce(EngineError) + Send + 'static,
    {
        Self::ensure_destination(endpoint)?;
        self.ensure_open()?;
        let _region = self.inner.gate.track();

        let wire_type = self.inner.names.resolve::<Req>();
        let bytes = endpoint.format().to_bytes(request)?;
        let frame = BinaryMessage {
            bytes,
            wire_type: wire_type.to_string(),
        };
        let group = self.group(endpoint)?;

        // Whichever of {response, decode failure, timeout, shutdown} comes
        // first takes the pair; the rest find the slot empty.
        #[allow(clippy::type_complexity)]
        let slot: Arc<
            Mutex<Option<(Box<dyn FnOnce(Resp) + Send>, Box<dyn FnOnce(EngineError) + Send>)>>,
        > = Arc::new(Mutex::new(Some((
            Box::new(on_response),
            Box::new(on_failure),
        ))));

        let format = endpoint.format();
        let tracker = self.inner.tracker.clone();
        let response_slot = slot.clone();
        let on_wire_response: ResponseFn = Arc::new(move |reply: BinaryMessage| {
            let taken = response_slot
                .lock()
                .expect("request outcome slot poisoned")
                .take();
            let Some((respond, fail)) = taken else {
                tracing::debug!("dropping response for settled request");
                return;
            };
            match format.from_bytes::<Resp>(&reply.bytes) {
                Ok(response) => {
                    if let Err(payload) =
                        catch_unwind(AssertUnwindSafe(move || respond(response)))
                    {
                        tracing::warn!(
                            panic = panic_message(payload.as_ref()),
                            "response callback panicked"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        wire_type = %reply.wire_type,
                        error = %error,
                        "failed to decode response"
                    );
                    fail(EngineError::Processing {
                        source: error.into(),
                    });
                }
            }
            // Sweep the completed handle promptly.
            tracker.tick_soon();
        });

        let handle = group
            .send_request(endpoint.destination(), frame, on_wire_response)
            .await
            .map_err(|source| transport_error(endpoint, source))?;

        let failure_slot = slot;
        self.inner.tracker.register(
            handle.clone(),
            timeout,
            Box::new(move |error| {
                if let Some((_, fail)) = failure_slot
                    .lock()
                    .expect("request outcome slot poisoned")
                    .take()
                {
                    fail(error);
                }
            }),
        );
        Ok(handle)
    }
}

/// # Handler registration
impl MessageBus {
    /// Installs a request handler on `endpoint`. Inbound requests are
    /// decoded as `Req`, handed to `handler`, and its `Resp` is encoded as
    /// the reply; handler errors are reported to the transport, which sends
    /// no reply.
    ///
    /// The registration heals itself: on a transport
    /// [`Failure`](TransportEventKind::Failure) event it re-registers, and
    /// keeps retrying at the configured interval until it succeeds, the
    /// registration is disposed, or the engine shuts down.
    pub async fn register_handler<Req, Resp, F>(
        &self,
        endpoint: &Endpoint,
        handler: F,
    ) -> Result<Registration, EngineError>
    where
        Req: Contract + DeserializeOwned + Send + 'static,
        Resp: Contract + Serialize + Send + 'static,
        F: Fn(Req) -> Result<Resp, BoxError> + Send + Sync + 'static,
    {
        Self::ensure_destination(endpoint)?;
        self.ensure_open()?;
        let _region = self.inner.gate.track();

        let format = endpoint.format();
        let request_type = self.inner.names.resolve::<Req>();
        let response_type = self.inner.names.resolve::<Resp>();

        let wire_handler: WireHandlerFn = Arc::new(move |frame: BinaryMessage| {
            let request: Req = format.from_bytes(&frame.bytes)?;
            let response = handler(request)?;
            let bytes = format.to_bytes(&response)?;
            Ok(BinaryMessage {
                bytes,
                wire_type: response_type.to_string(),
            })
        });

        let installer = Arc::new(HandlerInstaller {
            transports: self.inner.transports.clone(),
            endpoint: endpoint.clone(),
            wire_handler,
            filter: endpoint
                .shared_destination()
                .then(|| request_type.to_string()),
        });

        let slot: Arc<Mutex<Option<Box<dyn Teardown>>>> = Arc::new(Mutex::new(None));
        let first = installer.install().await?;
        *slot.lock().expect("handler slot poisoned") = Some(first);

        let registration_stop = Stopper::new();
        tokio::spawn(reregister_worker(
            installer,
            slot.clone(),
            self.inner.transports.events(),
            registration_stop.clone(),
            self.inner.stopper.clone(),
            self.inner.config.reregister_interval,
        ));

        Ok(self.inner.registry.create(Box::new(move || {
            registration_stop.stop();
            let current = slot.lock().expect("handler slot poisoned").take();
            if let Some(current) = current {
                current.dispose();
            }
        })))
    }
}

struct HandlerInstaller {
    transports: Arc<dyn TransportManager>,
    endpoint: Endpoint,
    wire_handler: WireHandlerFn,
    filter: Option<String>,
}

impl HandlerInstaller {
    async fn install(&self) -> Result<Box<dyn Teardown>, EngineError> {
        let group = self
            .transports
            .processing_group(self.endpoint.transport_id(), self.endpoint.destination())
            .map_err(|source| transport_error(&self.endpoint, source))?;
        group
            .register_handler(
                self.endpoint.destination(),
                self.wire_handler.clone(),
                self.filter.clone(),
            )
            .await
            .map_err(|source| transport_error(&self.endpoint, source))
    }
}

/// Re-installs a handler whenever its transport reports a failure. Event
/// handling never unsubscribes itself: errors are logged and the loop keeps
/// listening.
async fn reregister_worker(
    installer: Arc<HandlerInstaller>,
    slot: Arc<Mutex<Option<Box<dyn Teardown>>>>,
    mut events: broadcast::Receiver<TransportEvent>,
    registration_stop: Stopper,
    engine_stop: Stopper,
    retry_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = registration_stop.wait_stopped() => return,
            _ = engine_stop.wait_stopped() => return,
            event = events.recv() => match event {
                Ok(event)
                    if event.kind == TransportEventKind::Failure
                        && event.transport_id == installer.endpoint.transport_id() =>
                {
                    reinstall(
                        &installer,
                        &slot,
                        &registration_stop,
                        &engine_stop,
                        retry_interval,
                    )
                    .await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transport event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn reinstall(
    installer: &HandlerInstaller,
    slot: &Mutex<Option<Box<dyn Teardown>>>,
    registration_stop: &Stopper,
    engine_stop: &Stopper,
    retry_interval: Duration,
) {
    loop {
        if registration_stop.is_stopped() || engine_stop.is_stopped() {
            return;
        }
        match installer.install().await {
            Ok(fresh) => {
                if registration_stop.is_stopped() || engine_stop.is_stopped() {
                    fresh.dispose();
                    return;
                }
                let stale = slot.lock().expect("handler slot poisoned").replace(fresh);
                if let Some(stale) = stale {
                    stale.dispose();
                }
                tracing::info!(
                    transport_id = installer.endpoint.transport_id(),
                    destination = installer.endpoint.destination(),
                    "handler re-registered after transport failure"
                );
                return;
            }
            Err(error) => {
                tracing::warn!(
                    transport_id = installer.endpoint.transport_id(),
                    destination = installer.endpoint.destination(),
                    error = %error,
                    retry_in = ?retry_interval,
                    "handler re-registration failed"
                );
                tokio::select! {
                    _ = registration_stop.wait_stopped() => return,
                    _ = engine_stop.wait_stopped() => return,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        }
    }
}

/// Runs a subscriber callback, translating errors and panics into a
/// delayed reject (a no-op if the callback already settled).
fn run_guarded(ack: &Ack, unack_delay: Duration, callback: impl FnOnce() -> Result<(), BoxError>) {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(error = %error, "subscriber callback failed");
            ack.settle(unack_delay, false);
        }
        Err(payload) => {
            tracing::warn!(
                panic = panic_message(payload.as_ref()),
                "subscriber callback panicked"
            );
            ack.settle(unack_delay, false);
        }
    }
}

fn transport_error(endpoint: &Endpoint, source: BoxError) -> EngineError {
    tracing::error!(
        transport_id = endpoint.transport_id(),
        destination = endpoint.destination(),
        error = %source,
        "transport operation failed"
    );
    EngineError::Transport {
        transport_id: endpoint.transport_id().to_string(),
        destination: endpoint.destination().to_string(),
        source,
    }
}
