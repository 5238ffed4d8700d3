//! Outstanding-request tracking with per-request deadlines.

use core::time::Duration;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use super::util::{Stopper, Timer};
use crate::transport::RequestHandle;
use crate::EngineError;

pub(crate) type FailureFn = Box<dyn FnOnce(EngineError) + Send>;

struct Entry {
    handle: RequestHandle,
    timeout: Duration,
    on_failure: FailureFn,
}

/// Watches every outstanding request and guarantees a resolution for each:
/// the registered failure callback fires with a timeout error unless a
/// response marked the handle complete first. Completed handles are swept
/// and disposed so transport correlators never linger.
pub(crate) struct RequestTracker {
    entries: Mutex<Vec<Entry>>,
    timer: Timer,
}

impl RequestTracker {
    pub fn spawn(stop: Stopper) -> Arc<Self> {
        let tracker = Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            timer: Timer::new(),
        });
        let sweeper = tracker.clone();
        tracker.timer.start(stop, move || sweeper.sweep());
        tracker
    }

    /// Stamps the handle's deadline and starts watching it.
    pub fn register(&self, handle: RequestHandle, timeout: Duration, on_failure: FailureFn) {
        if let Some(due) = Instant::now().checked_add(timeout) {
            handle.set_due(due);
        }
        self.entries
            .lock()
            .expect("request tracker poisoned")
            .push(Entry {
                handle,
                timeout,
                on_failure,
            });
        self.timer.schedule_after(timeout);
    }

    /// Nudges the sweeper so a freshly completed handle is collected
    /// promptly.
    pub fn tick_soon(&self) {
        self.timer.schedule_after(Duration::from_millis(1));
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut ripe = Vec::new();
        let next_due = {
            let mut entries = self.entries.lock().expect("request tracker poisoned");
            let mut i = 0;
            while i < entries.len() {
                let entry = &entries[i];
                let due = entry.handle.due_date().is_some_and(|at| at <= now);
                if due || entry.handle.is_complete() {
                    ripe.push(entries.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            entries
                .iter()
                .filter_map(|entry| entry.handle.due_date())
                .min()
        };
        for entry in ripe {
            resolve(entry);
        }
        if let Some(due) = next_due {
            self.timer.schedule_after(due.duration_since(now));
        }
    }

    /// Fails every remaining request as timed out. Used by shutdown.
    pub fn stop_all(&self) {
        let drained = std::mem::take(&mut *self.entries.lock().expect("request tracker poisoned"));
        for entry in drained {
            resolve(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("request tracker poisoned").len()
    }
}

// Callbacks run outside the tracker lock.
fn resolve(entry: Entry) {
    entry.handle.dispose();
    if !entry.handle.is_complete() {
        (entry.on_failure)(EngineError::Timeout(entry.timeout));
    }
}
