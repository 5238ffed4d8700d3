//! Shared fixtures for the engine integration tests.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wirebus::transport::in_memory::InMemoryTransport;
use wirebus::{Contract, Endpoint, MessageBus, WireFormat};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping(pub u32);
impl Contract for Ping {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong(pub u32);
impl Contract for Pong {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub body: String,
}
impl Contract for Note {
    const CONTRACT_NAME: Option<&'static str> = Some("note.v1");
}

/// A bus wired to a fresh in-memory transport, plus the transport itself
/// for ack and registration inspection.
pub fn loopback() -> (InMemoryTransport, MessageBus) {
    let transport = InMemoryTransport::new();
    let bus = MessageBus::new(Arc::new(transport.clone()));
    (transport, bus)
}

pub fn endpoint(destination: &str) -> Endpoint {
    Endpoint::new("local", destination, WireFormat::Json)
}

/// Polls `condition` until it holds, failing the test after five seconds
/// (virtual time under a paused clock).
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
