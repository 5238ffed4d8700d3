//! An in-process loopback transport.
//!
//! Messages fan out to the destination's current subscribers; requests are
//! answered by registered handlers on spawned tasks. There is no queueing,
//! so `lifespan` has nothing to act on and is ignored.
//!
//! The driver keeps a log of every raw acknowledgement and offers failure
//! simulation hooks ([`emit_failure`](InMemoryTransport::emit_failure),
//! [`set_reject_registrations`](InMemoryTransport::set_reject_registrations),
//! [`drop_registrations`](InMemoryTransport::drop_registrations)), which
//! makes it the reference harness for exercising engine behavior without a
//! broker.

use core::time::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{
    InboundFn, ProcessingGroup, RawAck, RequestHandle, ResponseFn, Teardown, TransportEvent,
    TransportEventKind, TransportManager, WireHandlerFn,
};
use crate::{BinaryMessage, BoxError};

const EVENT_CHANNEL_DEPTH: usize = 64;

/// One raw acknowledgement observed by the transport.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub destination: String,
    pub wire_type: String,
    pub accepted: bool,
    pub at: Instant,
}

#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Shared>,
}

struct Shared {
    destinations: Mutex<HashMap<(String, String), Arc<Destination>>>,
    events: broadcast::Sender<TransportEvent>,
    acks: Mutex<Vec<AckRecord>>,
    reject_registrations: AtomicBool,
}

impl Default for Shared {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Self {
            destinations: Mutex::new(HashMap::new()),
            events,
            acks: Mutex::new(Vec::new()),
            reject_registrations: AtomicBool::new(false),
        }
    }
}

struct Destination {
    name: String,
    subscribers: Mutex<Vec<Subscriber>>,
    handlers: Mutex<Vec<HandlerEntry>>,
    pending: Mutex<HashMap<u64, ResponseFn>>,
    next_id: AtomicU64,
}

struct Subscriber {
    id: u64,
    filter: Option<String>,
    deliver: InboundFn,
}

struct HandlerEntry {
    id: u64,
    filter: Option<String>,
    handler: WireHandlerFn,
}

impl Destination {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn filter_matches(filter: &Option<String>, wire_type: &str) -> bool {
    match filter {
        Some(expected) => expected == wire_type,
        None => true,
    }
}

impl Shared {
    fn destination(&self, transport_id: &str, name: &str) -> Arc<Destination> {
        let key = (transport_id.to_string(), name.to_string());
        let mut destinations = self.destinations.lock().expect("destination map poisoned");
        destinations
            .entry(key)
            .or_insert_with(|| Arc::new(Destination::new(name)))
            .clone()
    }

    fn record_ack(&self, destination: &str, wire_type: &str, accepted: bool) {
        tracing::trace!(destination, wire_type, accepted, "raw ack");
        self.acks.lock().expect("ack log poisoned").push(AckRecord {
            destination: destination.to_string(),
            wire_type: wire_type.to_string(),
            accepted,
            at: Instant::now(),
        });
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every raw acknowledgement seen so far.
    pub fn acks(&self) -> Vec<AckRecord> {
        self.inner.acks.lock().expect("ack log poisoned").clone()
    }

    /// Broadcasts a connection-failure event for `transport_id`.
    pub fn emit_failure(&self, transport_id: &str) {
        let _ = self.inner.events.send(TransportEvent {
            transport_id: transport_id.to_string(),
            kind: TransportEventKind::Failure,
        });
    }

    /// Broadcasts a recovery event for `transport_id`.
    pub fn emit_recovered(&self, transport_id: &str) {
        let _ = self.inner.events.send(TransportEvent {
            transport_id: transport_id.to_string(),
            kind: TransportEventKind::Recovered,
        });
    }

    /// While set, `register_handler` fails, emulating a broker refusing
    /// channel setup.
    pub fn set_reject_registrations(&self, reject: bool) {
        self.inner
            .reject_registrations
            .store(reject, Ordering::SeqCst);
    }

    /// Removes every installed handler on `transport_id`, emulating the
    /// server-side loss that comes with a dropped connection.
    pub fn drop_registrations(&self, transport_id: &str) {
        let destinations = self
            .inner
            .destinations
            .lock()
            .expect("destination map poisoned");
        for ((tid, _), destination) in destinations.iter() {
            if tid == transport_id {
                destination
                    .handlers
                    .lock()
                    .expect("handler list poisoned")
                    .clear();
            }
        }
    }

    /// Number of live handlers on `(transport_id, destination)`.
    pub fn handler_count(&self, transport_id: &str, destination: &str) -> usize {
        let key = (transport_id.to_string(), destination.to_string());
        self.inner
            .destinations
            .lock()
            .expect("destination map poisoned")
            .get(&key)
            .map(|d| d.handlers.lock().expect("handler list poisoned").len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TransportManager for InMemoryTransport {
    fn processing_group(
        &self,
        transport_id: &str,
        destination: &str,
    ) -> Result<Arc<dyn ProcessingGroup>, BoxError> {
        // Touch the destination so it exists before any traffic.
        self.inner.destination(transport_id, destination);
        Ok(Arc::new(InMemoryGroup {
            shared: self.inner.clone(),
            transport_id: transport_id.to_string(),
        }))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) {
        self.inner
            .destinations
            .lock()
            .expect("destination map poisoned")
            .clear();
    }
}

struct InMemoryGroup {
    shared: Arc<Shared>,
    transport_id: String,
}

struct RemoveSubscriber {
    destination: Arc<Destination>,
    id: u64,
}

impl Teardown for RemoveSubscriber {
    fn dispose(&self) {
        self.destination
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .retain(|s| s.id != self.id);
    }
}

struct RemoveHandler {
    destination: Arc<Destination>,
    id: u64,
}

impl Teardown for RemoveHandler {
    fn dispose(&self) {
        self.destination
            .handlers
            .lock()
            .expect("handler list poisoned")
            .retain(|h| h.id != self.id);
    }
}

#[async_trait]
impl ProcessingGroup for InMemoryGroup {
    async fn send(
        &self,
        destination: &str,
        message: BinaryMessage,
        _lifespan: Duration,
    ) -> Result<(), BoxError> {
        let dest = self.shared.destination(&self.transport_id, destination);
        let matching: Vec<InboundFn> = dest
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .iter()
            .filter(|s| filter_matches(&s.filter, &message.wire_type))
            .map(|s| s.deliver.clone())
            .collect();

        if matching.is_empty() {
            tracing::debug!(
                destination = %dest.name,
                wire_type = %message.wire_type,
                "no subscribers; message dropped"
            );
            return Ok(());
        }

        for deliver in matching {
            let frame = message.clone();
            let shared = self.shared.clone();
            let dest_name = dest.name.clone();
            let wire_type = frame.wire_type.clone();
            let ack: RawAck = Box::new(move |accepted| {
                shared.record_ack(&dest_name, &wire_type, accepted);
            });
            tokio::spawn(async move {
                deliver(frame, ack);
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        on_message: InboundFn,
        wire_type_filter: Option<String>,
    ) -> Result<Box<dyn Teardown>, BoxError> {
        let dest = self.shared.destination(&self.transport_id, destination);
        let id = dest.next_id();
        dest.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Subscriber {
                id,
                filter: wire_type_filter,
                deliver: on_message,
            });
        Ok(Box::new(RemoveSubscriber {
            destination: dest,
            id,
        }))
    }

    async fn register_handler(
        &self,
        destination: &str,
        handler: WireHandlerFn,
        wire_type_filter: Option<String>,
    ) -> Result<Box<dyn Teardown>, BoxError> {
        if self.shared.reject_registrations.load(Ordering::SeqCst) {
            return Err("transport refused handler registration".into());
        }
        let dest = self.shared.destination(&self.transport_id, destination);
        let id = dest.next_id();
        dest.handlers
            .lock()
            .expect("handler list poisoned")
            .push(HandlerEntry {
                id,
                filter: wire_type_filter,
                handler,
            });
        Ok(Box::new(RemoveHandler {
            destination: dest,
            id,
        }))
    }

    async fn send_request(
        &self,
        destination: &str,
        message: BinaryMessage,
        on_response: ResponseFn,
    ) -> Result<RequestHandle, BoxError> {
        let dest = self.shared.destination(&self.transport_id, destination);
        let correlator = dest.next_id();
        dest.pending
            .lock()
            .expect("correlator map poisoned")
            .insert(correlator, on_response);

        let handle = RequestHandle::new({
            let dest = dest.clone();
            move || {
                dest.pending
                    .lock()
                    .expect("correlator map poisoned")
                    .remove(&correlator);
            }
        });

        let matching: Vec<WireHandlerFn> = dest
            .handlers
            .lock()
            .expect("handler list poisoned")
            .iter()
            .filter(|h| filter_matches(&h.filter, &message.wire_type))
            .map(|h| h.handler.clone())
            .collect();

        for handler in matching {
            let frame = message.clone();
            let dest = dest.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                match handler(frame) {
                    Ok(reply) => {
                        let callback = dest
                            .pending
                            .lock()
                            .expect("correlator map poisoned")
                            .get(&correlator)
                            .cloned();
                        if let Some(callback) = callback {
                            handle.mark_complete();
                            callback(reply);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            destination = %dest.name,
                            error = %error,
                            "request handler failed; no reply sent"
                        );
                    }
                }
            });
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, timeout};

    fn frame(wire_type: &str, bytes: &[u8]) -> BinaryMessage {
        BinaryMessage {
            bytes: bytes.to_vec(),
            wire_type: wire_type.to_string(),
        }
    }

    async fn wait_for(what: impl Fn() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !what() {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let transport = InMemoryTransport::new();
        let group = transport.processing_group("mem", "inbox").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let on_message: InboundFn = Arc::new(move |_msg, ack| {
            counted.fetch_add(1, Ordering::SeqCst);
            ack(true);
        });
        group
            .subscribe("inbox", on_message, Some("Wanted".into()))
            .await
            .unwrap();

        group
            .send("inbox", frame("Unwanted", b"{}"), Duration::ZERO)
            .await
            .unwrap();
        group
            .send("inbox", frame("Wanted", b"{}"), Duration::ZERO)
            .await
            .unwrap();

        wait_for(|| hits.load(Ordering::SeqCst) == 1).await;
        let acks = transport.acks();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].accepted);
        assert_eq!(acks[0].wire_type, "Wanted");
    }

    #[tokio::test]
    async fn subscriber_teardown_stops_delivery() {
        let transport = InMemoryTransport::new();
        let group = transport.processing_group("mem", "inbox").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let on_message: InboundFn = Arc::new(move |_msg, _ack| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let sub = group.subscribe("inbox", on_message, None).await.unwrap();
        group
            .send("inbox", frame("A", b"{}"), Duration::ZERO)
            .await
            .unwrap();
        wait_for(|| hits.load(Ordering::SeqCst) == 1).await;

        sub.dispose();
        sub.dispose();
        group
            .send("inbox", frame("A", b"{}"), Duration::ZERO)
            .await
            .unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requests_reach_handlers_and_responses_come_back() {
        let transport = InMemoryTransport::new();
        let group = transport.processing_group("mem", "math").unwrap();

        let handler: WireHandlerFn = Arc::new(|req| {
            let mut bytes = req.bytes;
            bytes.reverse();
            Ok(BinaryMessage {
                bytes,
                wire_type: "Reply".into(),
            })
        });
        group.register_handler("math", handler, None).await.unwrap();

        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        let on_response: ResponseFn = Arc::new(move |reply| {
            *sink.lock().unwrap() = Some(reply);
        });
        let handle = group
            .send_request("math", frame("Ask", b"abc"), on_response)
            .await
            .unwrap();

        wait_for(|| got.lock().unwrap().is_some()).await;
        let reply = got.lock().unwrap().take().unwrap();
        assert_eq!(reply.bytes, b"cba");
        assert!(handle.is_complete());
    }

    #[tokio::test]
    async fn disposed_handle_drops_late_responses() {
        let transport = InMemoryTransport::new();
        let group = transport.processing_group("mem", "slow").unwrap();

        let handler: WireHandlerFn = Arc::new(|req| Ok(req));
        group.register_handler("slow", handler, None).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let on_response: ResponseFn = Arc::new(move |_reply| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let handle = group
            .send_request("slow", frame("Ask", b"x"), on_response)
            .await
            .unwrap();

        // Close the correlator before the handler task gets to run.
        handle.dispose();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!handle.is_complete());
    }

    #[tokio::test]
    async fn rejected_registrations_and_drops() {
        let transport = InMemoryTransport::new();
        let group = transport.processing_group("mem", "jobs").unwrap();
        let handler: WireHandlerFn = Arc::new(|req| Ok(req));

        transport.set_reject_registrations(true);
        assert!(group
            .register_handler("jobs", handler.clone(), None)
            .await
            .is_err());

        transport.set_reject_registrations(false);
        let _keep = group.register_handler("jobs", handler, None).await.unwrap();
        assert_eq!(transport.handler_count("mem", "jobs"), 1);

        transport.drop_registrations("mem");
        assert_eq!(transport.handler_count("mem", "jobs"), 0);
    }
}
