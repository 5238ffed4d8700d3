//! Ownership of teardown tokens handed out by the engine.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Destructor = Box<dyn FnOnce() + Send>;

/// Holds the destructor of every live registration, keyed by an arena id in
/// insertion order. Disposing a token removes its entry before running the
/// destructor, so disposal is idempotent from any copy and shutdown can
/// walk the registry head-first while entries disappear under it.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    handles: BTreeMap<u64, Destructor>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(self: &Arc<Self>, destructor: Destructor) -> Registration {
        let id = {
            let mut inner = self.inner.lock().expect("handle registry poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            inner.handles.insert(id, destructor);
            id
        };
        Registration {
            id,
            registry: self.clone(),
        }
    }

    fn dispose_id(&self, id: u64) {
        let destructor = self
            .inner
            .lock()
            .expect("handle registry poisoned")
            .handles
            .remove(&id);
        if let Some(destructor) = destructor {
            destructor();
        }
    }

    /// Disposes every remaining handle, oldest first. Each dispose mutates
    /// the registry, so the head is refetched every round.
    pub fn dispose_all(&self) {
        loop {
            let next = self
                .inner
                .lock()
                .expect("handle registry poisoned")
                .handles
                .pop_first();
            match next {
                Some((_, destructor)) => destructor(),
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("handle registry poisoned")
            .handles
            .len()
    }
}

/// Teardown token for a subscription or handler registration.
///
/// Disposal is explicit and idempotent; dropping the token leaves the
/// registration alive until engine shutdown tears it down.
#[derive(Clone)]
pub struct Registration {
    id: u64,
    registry: Arc<HandleRegistry>,
}

impl Registration {
    /// Tears the registration down now.
    pub fn dispose(&self) {
        self.registry.dispose_id(self.id);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
