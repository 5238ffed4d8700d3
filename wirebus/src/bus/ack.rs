//! Acknowledgement control: the subscriber-facing [`Ack`] handle and the
//! scheduler that commits delayed acknowledgements.

use core::time::Duration;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use super::util::{panic_message, Stopper, Timer};
use crate::transport::RawAck;

// Keeps deadline arithmetic safe against absurd caller-provided delays.
const MAX_ACK_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

type Thunk = Box<dyn FnOnce() + Send>;

/// Acknowledgement handle for one delivered message.
///
/// `settle(delay, accepted)` commits (`accepted = true`) or rejects the
/// message; a non-zero `delay` postpones the commit, giving
/// visibility-timeout style redelivery control. The underlying transport
/// acknowledgement runs exactly once: the first settle wins and later calls
/// are ignored. Clones share the same underlying acknowledgement.
#[derive(Clone)]
pub struct Ack {
    shared: Arc<AckShared>,
}

struct AckShared {
    raw: Mutex<Option<RawAck>>,
    scheduler: Arc<DeferredAckScheduler>,
}

impl Ack {
    pub(crate) fn new(raw: RawAck, scheduler: Arc<DeferredAckScheduler>) -> Self {
        Self {
            shared: Arc::new(AckShared {
                raw: Mutex::new(Some(raw)),
                scheduler,
            }),
        }
    }

    /// Settles the message now (`delay == 0`) or at `now + delay`.
    pub fn settle(&self, delay: Duration, accepted: bool) {
        let raw = self
            .shared
            .raw
            .lock()
            .expect("ack slot poisoned")
            .take();
        let Some(raw) = raw else {
            tracing::debug!("acknowledgement already settled");
            return;
        };
        if delay.is_zero() {
            raw(accepted);
        } else {
            self.shared
                .scheduler
                .schedule_in(delay, Box::new(move || raw(accepted)));
        }
    }

    /// True once a settle has consumed the underlying acknowledgement.
    pub fn is_settled(&self) -> bool {
        self.shared.raw.lock().expect("ack slot poisoned").is_none()
    }
}

impl core::fmt::Debug for Ack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ack")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Holds `(due, thunk)` pairs and runs each thunk exactly once: at its due
/// time, or during the shutdown drain, whichever comes first.
pub(crate) struct DeferredAckScheduler {
    entries: Mutex<Vec<(Instant, Thunk)>>,
    timer: Timer,
    draining: AtomicBool,
}

impl DeferredAckScheduler {
    pub fn spawn(stop: Stopper) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            timer: Timer::new(),
            draining: AtomicBool::new(false),
        });
        let sweeper = scheduler.clone();
        scheduler.timer.start(stop, move || sweeper.sweep());
        scheduler
    }

    /// Queues `thunk` to run after `delay`. A zero delay runs it inline, as
    /// does any schedule arriving after the drain started.
    pub fn schedule_in(&self, delay: Duration, thunk: Thunk) {
        if delay.is_zero() || self.draining.load(Ordering::SeqCst) {
            run_thunk(thunk);
            return;
        }
        let delay = delay.min(MAX_ACK_DELAY);
        let due = Instant::now() + delay;
        self.entries
            .lock()
            .expect("deferred ack list poisoned")
            .push((due, thunk));
        self.timer.schedule_after(delay);
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut ripe = Vec::new();
        // Extraction and removal happen in one critical section, so a
        // concurrent drain cannot observe an entry twice.
        let next_due = {
            let mut entries = self.entries.lock().expect("deferred ack list poisoned");
            let mut i = 0;
            while i < entries.len() {
                if entries[i].0 <= now {
                    ripe.push(entries.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            entries.iter().map(|(due, _)| *due).min()
        };
        for (_, thunk) in ripe {
            run_thunk(thunk);
        }
        if let Some(due) = next_due {
            self.timer.schedule_after(due.duration_since(now));
        }
    }

    /// Runs every queued thunk regardless of due time. Used by shutdown so
    /// no acknowledgement is lost.
    pub fn force_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let drained =
            std::mem::take(&mut *self.entries.lock().expect("deferred ack list poisoned"));
        for (_, thunk) in drained {
            run_thunk(thunk);
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.entries
            .lock()
            .expect("deferred ack list poisoned")
            .len()
    }
}

fn run_thunk(thunk: Thunk) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(thunk)) {
        tracing::warn!(
            panic = panic_message(payload.as_ref()),
            "deferred acknowledgement failed"
        );
    }
}
