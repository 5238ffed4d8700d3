//! Shared plumbing for the engine's background machinery.

use core::time::Duration;
use std::any::Any;
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// A set-once, waitable stop signal shared by every worker the engine owns.
#[derive(Clone, Default)]
pub(crate) struct Stopper {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl Stopper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub async fn wait_stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the check so a concurrent stop() cannot slip
            // between them.
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// A single-shot re-arming deadline worker.
///
/// [`schedule_after`](Timer::schedule_after) moves the next fire time to
/// `min(current, now + delay)`; the worker task sleeps until due, invokes
/// the callback once, and parks until re-armed. The callback re-arms for
/// whatever work remains.
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    next: Mutex<Option<Instant>>,
    notify: Notify,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                next: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Spawns the worker task. Call once, right after construction.
    pub fn start(&self, stop: Stopper, on_fire: impl Fn() + Send + Sync + 'static) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                let due = *shared.next.lock().expect("timer deadline poisoned");
                let wait = async {
                    match due {
                        Some(at) => sleep_until(at).await,
                        None => pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = stop.wait_stopped() => return,
                    // Re-armed; re-read the deadline.
                    _ = shared.notify.notified() => {}
                    _ = wait => {
                        *shared.next.lock().expect("timer deadline poisoned") = None;
                        on_fire();
                    }
                }
            }
        });
    }

    pub fn schedule_after(&self, delay: Duration) {
        let Some(due) = Instant::now().checked_add(delay) else {
            // Effectively never; leave the worker parked.
            return;
        };
        {
            let mut next = self.shared.next.lock().expect("timer deadline poisoned");
            match *next {
                Some(current) if current <= due => {}
                _ => *next = Some(due),
            }
        }
        self.shared.notify.notify_one();
    }
}

/// Best-effort rendering of a panic payload for log output.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
