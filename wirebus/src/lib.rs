//! A transport-agnostic typed messaging engine.
//!
//! `wirebus` is a broker-client façade: applications exchange strongly-typed
//! messages addressed by an [`Endpoint`] (transport id, destination name,
//! wire format), without caring about wire encoding, connection pooling, or
//! acknowledgement plumbing. The [`MessageBus`] provides:
//!
//! - one-way [`send`](MessageBus::send) with an optional broker-side lifespan,
//! - typed [`subscribe`](MessageBus::subscribe) with automatic or explicit
//!   [`Ack`] control, including delayed acknowledgements,
//! - request/reply in an awaitable form ([`send_request`](MessageBus::send_request))
//!   and a callback form with per-request timeouts,
//! - server-side [`register_handler`](MessageBus::register_handler) with
//!   automatic re-registration when the transport reports a failure,
//! - a draining [`shutdown`](MessageBus::shutdown) that fails outstanding
//!   requests, flushes deferred acknowledgements, and tears down every
//!   registration in order.
//!
//! Delivery is at-least-once: the subscriber (or the engine on its behalf)
//! decides whether a message is committed, rejected, or redelivered later.
//!
//! Concrete brokers plug in through the [`transport`] contracts. The crate
//! ships an in-memory loopback driver used for local development and tests.
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use wirebus::transport::in_memory::InMemoryTransport;
//! use wirebus::{Contract, Endpoint, MessageBus, WireFormat};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Greeting {
//!     body: String,
//! }
//! impl Contract for Greeting {}
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let transport = InMemoryTransport::new();
//!     let bus = MessageBus::new(Arc::new(transport));
//!     let endpoint = Endpoint::new("local", "greetings", WireFormat::Json);
//!
//!     let _listener = bus
//!         .subscribe(&endpoint, |greeting: Greeting| {
//!             println!("{}", greeting.body);
//!             Ok(())
//!         })
//!         .await
//!         .unwrap();
//!
//!     bus.send(&Greeting { body: "hello".into() }, &endpoint)
//!         .await
//!         .unwrap();
//!     bus.shutdown().await;
//! }
//! ```

use core::time::Duration;

use thiserror::Error;

pub mod bus;
pub mod contract;
pub mod format;
pub mod transport;

pub use bus::{Ack, MessageBus, Registration};
pub use contract::{Contract, KnownTypes, TypeNames};
pub use format::{FormatError, WireFormat};
pub use transport::RequestHandle;

/// Boxed error type used at the transport and user-callback seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Delay applied when the engine rejects a message it could not process
/// (decode failure or subscriber error), so the broker redelivers later
/// rather than immediately.
pub const DEFAULT_UNACK_DELAY: Duration = Duration::from_millis(60_000);

/// Default broker-side message lifespan. Zero means the message never
/// expires.
pub const DEFAULT_MESSAGE_LIFESPAN: Duration = Duration::ZERO;

/// Interval between handler re-registration attempts after a transport
/// failure.
pub const HANDLER_REREGISTER_INTERVAL: Duration = Duration::from_millis(60_000);

/// An addressable destination: which transport, which destination on it, and
/// how payloads are encoded there.
///
/// Endpoints are immutable values with structural equality. Marking an
/// endpoint [`shared`](Endpoint::shared) means the destination carries more
/// than one message schema, and single-type subscribers filter by wire type
/// name at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    transport_id: String,
    destination: String,
    format: WireFormat,
    shared_destination: bool,
}

impl Endpoint {
    pub fn new(
        transport_id: impl Into<String>,
        destination: impl Into<String>,
        format: WireFormat,
    ) -> Self {
        Self {
            transport_id: transport_id.into(),
            destination: destination.into(),
            format,
            shared_destination: false,
        }
    }

    /// Marks the destination as multiplexing several message schemas.
    pub fn shared(mut self) -> Self {
        self.shared_destination = true;
        self
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn shared_destination(&self) -> bool {
        self.shared_destination
    }
}

/// An encoded payload plus the wire type name identifying its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    /// The serialized payload.
    pub bytes: Vec<u8>,
    /// Schema identifier, as produced by [`contract::wire_name`].
    pub wire_type: String,
}

/// Tunables for a [`MessageBus`]. The defaults match broker conventions:
/// failed deliveries are redelivered after a minute, messages never expire,
/// and failed handler registrations retry every minute.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reject-and-redeliver delay used when inbound processing fails.
    pub unack_delay: Duration,
    /// Default lifespan handed to the transport on `send`.
    pub message_lifespan: Duration,
    /// Backoff between handler re-registration attempts.
    pub reregister_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unack_delay: DEFAULT_UNACK_DELAY,
            message_lifespan: DEFAULT_MESSAGE_LIFESPAN,
            reregister_interval: HANDLER_REREGISTER_INTERVAL,
        }
    }
}

/// Errors surfaced by [`MessageBus`] operations.
///
/// Inbound delivery problems (decode failures, subscriber errors) are never
/// surfaced here; they are logged and the message is negatively acknowledged
/// with [`DEFAULT_UNACK_DELAY`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    Argument(&'static str),

    /// The operation was attempted after shutdown began, or a waiting
    /// request was cancelled because shutdown began.
    #[error("the messaging engine is shutting down")]
    ShuttingDown,

    /// No response arrived before the request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A response arrived but could not be processed.
    #[error("response processing failed: {source}")]
    Processing {
        #[source]
        source: BoxError,
    },

    /// Payload encoding failed before the message reached the transport.
    #[error("payload encoding failed")]
    Codec(#[from] FormatError),

    /// The transport rejected the operation.
    #[error("transport failure on {transport_id}/{destination}: {source}")]
    Transport {
        transport_id: String,
        destination: String,
        #[source]
        source: BoxError,
    },
}

impl EngineError {
    /// True for the per-request deadline outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }

    /// True when the operation failed because the engine is shutting down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, EngineError::ShuttingDown)
    }
}
