// ── Subscription registry ──
//
// Decouples event production from consumption. Fan-out is synchronous
// and happens after cache side-effects, so a listener reading the cache
// inside its callback sees the event already applied.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use carelink_api::ServerEvent;
use tracing::warn;

type Listener = dyn Fn(&ServerEvent) + Send + Sync;

/// Registered listener callbacks.
///
/// Listeners are identified by an opaque id; registration order carries
/// no delivery guarantee. A listener that panics is logged and skipped
/// without affecting delivery to the rest.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<(u64, Arc<Listener>)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; the returned handle removes it.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Deliver one event to every currently-subscribed listener.
    ///
    /// Iterates a snapshot of the listener set, so a listener may
    /// unsubscribe (itself or others) from inside its callback without
    /// disturbing the current pass.
    pub fn dispatch(&self, event: &ServerEvent) {
        let snapshot: Vec<(u64, Arc<Listener>)> = self.lock().clone();

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(listener_id = id, "listener panicked during fan-out");
            }
        }
    }

    /// Remove every listener. Called on channel teardown.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|(lid, _)| *lid != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Arc<Listener>)>> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Handle for one registered listener.
///
/// Call [`unsubscribe`](Self::unsubscribe) to remove the listener;
/// repeated calls are a no-op. Dropping the handle does NOT unsubscribe
/// -- the listener stays registered for the life of the registry.
pub struct Subscription {
    registry: Arc<ListenerRegistry>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.registry.remove(self.id);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
