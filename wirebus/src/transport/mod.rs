//! Contracts between the engine and concrete transports.
//!
//! A transport driver exposes one [`ProcessingGroup`] per (transport id,
//! destination) pair; the group owns whatever connection and channel
//! resources that destination needs. The engine treats groups as opaque:
//! it hands them encoded frames and callbacks and receives teardown tokens
//! and [`RequestHandle`]s back.
//!
//! All errors crossing this seam are fatal for the operation that hit them;
//! drivers retry or absorb whatever they can before reporting.

use core::fmt;
use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::{BinaryMessage, BoxError};

pub mod in_memory;

/// Raw acknowledgement for one inbound frame: `true` commits, `false`
/// rejects. Invoked at most once.
pub type RawAck = Box<dyn FnOnce(bool) + Send>;

/// Inbound delivery callback handed to [`ProcessingGroup::subscribe`].
/// Invoked on tasks owned by the transport.
pub type InboundFn = Arc<dyn Fn(BinaryMessage, RawAck) + Send + Sync>;

/// Response delivery callback handed to [`ProcessingGroup::send_request`].
/// May be invoked more than once on fan-out destinations; the caller keeps
/// the correlator open until it disposes the [`RequestHandle`].
pub type ResponseFn = Arc<dyn Fn(BinaryMessage) + Send + Sync>;

/// Request handler installed by [`ProcessingGroup::register_handler`].
/// Returns the encoded reply frame.
pub type WireHandlerFn = Arc<dyn Fn(BinaryMessage) -> Result<BinaryMessage, BoxError> + Send + Sync>;

/// Idempotent teardown for a transport-side registration.
pub trait Teardown: Send + Sync {
    fn dispose(&self);
}

/// Connection-level lifecycle notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub transport_id: String,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportEventKind {
    /// The transport lost its connection; server-side registrations are gone.
    Failure,
    /// The transport reconnected.
    Recovered,
}

/// Factory and event source for [`ProcessingGroup`]s.
#[async_trait]
pub trait TransportManager: Send + Sync {
    /// Returns the group owning `(transport_id, destination)`, creating it
    /// on first use.
    fn processing_group(
        &self,
        transport_id: &str,
        destination: &str,
    ) -> Result<Arc<dyn ProcessingGroup>, BoxError>;

    /// A fresh subscription to connection lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Releases all transport resources.
    async fn close(&self) {}
}

/// A per-destination channel on one transport.
#[async_trait]
pub trait ProcessingGroup: Send + Sync {
    /// Publishes one frame. A zero `lifespan` means the message never
    /// expires at the broker.
    async fn send(
        &self,
        destination: &str,
        message: BinaryMessage,
        lifespan: Duration,
    ) -> Result<(), BoxError>;

    /// Installs an inbound delivery callback. When `wire_type_filter` is
    /// set, only frames carrying that wire type are delivered.
    async fn subscribe(
        &self,
        destination: &str,
        on_message: InboundFn,
        wire_type_filter: Option<String>,
    ) -> Result<Box<dyn Teardown>, BoxError>;

    /// Installs a request handler producing reply frames.
    async fn register_handler(
        &self,
        destination: &str,
        handler: WireHandlerFn,
        wire_type_filter: Option<String>,
    ) -> Result<Box<dyn Teardown>, BoxError>;

    /// Dispatches a request frame and opens a correlator delivering
    /// responses to `on_response` until the returned handle is disposed.
    async fn send_request(
        &self,
        destination: &str,
        message: BinaryMessage,
        on_response: ResponseFn,
    ) -> Result<RequestHandle, BoxError>;
}

/// Correlator token for one outstanding request.
///
/// Created by the transport when the request is dispatched. Carries the
/// request deadline stamped by the engine, a completion flag set when a
/// response is delivered, and a one-shot cancel closing the transport-side
/// correlator. Disposal is idempotent.
#[derive(Clone)]
pub struct RequestHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    complete: AtomicBool,
    due: Mutex<Option<Instant>>,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RequestHandle {
    /// A handle whose disposal runs `cancel` exactly once.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                complete: AtomicBool::new(false),
                due: Mutex::new(None),
                cancel: Mutex::new(Some(Box::new(cancel))),
            }),
        }
    }

    /// A handle with no transport-side correlator to cancel.
    pub fn detached() -> Self {
        Self::new(|| {})
    }

    /// Marks that a response was delivered for this request.
    pub fn mark_complete(&self) {
        self.inner.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.inner.complete.load(Ordering::SeqCst)
    }

    pub fn set_due(&self, at: Instant) {
        *self.inner.due.lock().expect("handle due date poisoned") = Some(at);
    }

    pub fn due_date(&self) -> Option<Instant> {
        *self.inner.due.lock().expect("handle due date poisoned")
    }

    /// Closes the transport-side correlator. Later responses are dropped.
    pub fn dispose(&self) {
        let cancel = self
            .inner
            .cancel
            .lock()
            .expect("handle cancel slot poisoned")
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// True once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner
            .cancel
            .lock()
            .expect("handle cancel slot poisoned")
            .is_none()
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("complete", &self.is_complete())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
