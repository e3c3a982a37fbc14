//! Event bus for lifecycle events
//!
//! Fan-out to typed subscribers keyed by event kind plus wildcard
//! subscribers. Delivery within a kind follows insertion order, typed
//! handlers run before wildcards, and a panicking handler never prevents
//! the remaining handlers from running nor reaches the emitter. The handler
//! set is snapshotted per emission, so handlers may subscribe/unsubscribe
//! freely from inside a delivery.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bulkflow_shared::{EngineEvent, EventKind};
use parking_lot::RwLock;
use tracing::error;

/// Subscriber callback
pub type EventHandler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Opaque subscription handle returned by `on`/`on_any`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    typed: HashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
    wildcard: Vec<(HandlerId, EventHandler)>,
}

/// Per-job event bus
pub struct EventBus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.registry
            .write()
            .typed
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to every event
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.registry.write().wildcard.push((id, Arc::new(handler)));
        id
    }

    /// Remove a typed subscription; unknown ids are a no-op
    pub fn off(&self, id: HandlerId) {
        let mut registry = self.registry.write();
        for handlers in registry.typed.values_mut() {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    /// Remove a wildcard subscription; unknown ids are a no-op
    pub fn off_any(&self, id: HandlerId) {
        self.registry
            .write()
            .wildcard
            .retain(|(handler_id, _)| *handler_id != id);
    }

    /// Deliver an event to typed subscribers, then wildcards
    pub fn emit(&self, event: EngineEvent) {
        let snapshot: Vec<EventHandler> = {
            let registry = self.registry.read();
            let typed = registry
                .typed
                .get(&event.kind())
                .into_iter()
                .flatten()
                .map(|(_, handler)| handler.clone());
            let wildcard = registry.wildcard.iter().map(|(_, handler)| handler.clone());
            typed.chain(wildcard).collect()
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(
                    job_id = event.job_id(),
                    event = ?event.kind(),
                    "event handler panicked; continuing delivery"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn started(job_id: &str) -> EngineEvent {
        EngineEvent::JobStarted {
            job_id: job_id.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn typed_handlers_run_before_wildcards_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let order = order.clone();
            bus.on(EventKind::JobStarted, move |_| order.lock().push(label));
        }
        let wildcard_order = order.clone();
        bus.on_any(move |_| wildcard_order.lock().push("wildcard"));

        bus.emit(started("job"));
        assert_eq!(*order.lock(), vec!["first", "second", "wildcard"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::JobStarted, |_| panic!("boom"));
        let counter = delivered.clone();
        bus.on(EventKind::JobStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(started("job"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_only_the_addressed_handler() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        let counter = delivered.clone();
        let keep = bus.on(EventKind::JobStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = delivered.clone();
        let drop = bus.on(EventKind::JobStarted, move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        });

        bus.off(drop);
        // Removing twice, or removing an id that never existed, is harmless.
        bus.off(drop);
        bus.off_any(keep);

        bus.emit(started("job"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_only_receive_their_kind() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        bus.on(EventKind::JobCompleted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(started("job"));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }
}
