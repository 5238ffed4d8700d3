//! In-flight operation counting for the shutdown drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counts operations inside tracked regions. Shutdown waits on
/// [`wait_idle`](OperationGate::wait_idle) after new entries are barred, so
/// in-flight sends and subscribes finish before teardown proceeds.
#[derive(Default)]
pub(crate) struct OperationGate {
    count: AtomicUsize,
    idle: Notify,
}

impl OperationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a tracked region. The region ends when the permit drops,
    /// whatever the exit path.
    pub fn track(self: &Arc<Self>) -> OperationPermit {
        self.count.fetch_add(1, Ordering::SeqCst);
        OperationPermit { gate: self.clone() }
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once the count reaches zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct OperationPermit {
    gate: Arc<OperationGate>,
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        if self.gate.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.idle.notify_waiters();
        }
    }
}
