//! Synchronous, typed publish/subscribe dispatch.
//!
//! Handlers are registered either for one [`EventKind`] or on the generic
//! channel that sees every event. `raise` runs, on the caller's thread:
//! 1. every handler registered for `event.kind`, in registration order
//! 2. every generic handler, in registration order
//!
//! Handler lists are snapshotted before dispatch and the registry lock is
//! released while handlers run, so a handler may raise further events or
//! (un)register handlers. Such changes apply from the next raise on: a
//! handler unregistered by an earlier handler of the same raise still sees
//! that event once, and a handler registered mid-raise does not. There
//! is no recursion guard; a handler that unconditionally re-raises its own
//! kind will recurse until the stack runs out.

use crate::events::{Event, EventKind};
use crate::lock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::trace;

/// Errors surfaced by the bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Callback invoked with each dispatched event.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

/// Ids are handed out monotonically, so ordering a map by id preserves
/// registration order.
type HandlerList = BTreeMap<HandlerId, Handler>;

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, HandlerList>,
    generic: HandlerList,
}

/// The event bus.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped bus for sharing with handlers.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Attaches `handler` to events of `kind`.
    pub fn register<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        lock(&self.registry)
            .by_kind
            .entry(kind)
            .or_default()
            .insert(id, Arc::new(handler));
        id
    }

    /// Detaches a handler previously registered for `kind`.
    ///
    /// Returns false if no such handler was attached.
    pub fn unregister(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut registry = lock(&self.registry);
        let Some(list) = registry.by_kind.get_mut(&kind) else {
            return false;
        };
        let removed = list.remove(&id).is_some();
        if list.is_empty() {
            registry.by_kind.remove(&kind);
        }
        removed
    }

    /// Attaches `handler` to every event.
    pub fn register_generic<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        lock(&self.registry).generic.insert(id, Arc::new(handler));
        id
    }

    /// Detaches a generic handler.
    pub fn unregister_generic(&self, id: HandlerId) -> bool {
        lock(&self.registry).generic.remove(&id).is_some()
    }

    /// Dispatches `event` to every interested handler before returning.
    pub fn raise(&self, event: &Event) {
        let (specific, generic) = {
            let registry = lock(&self.registry);
            let specific: Vec<Handler> = registry
                .by_kind
                .get(&event.kind)
                .map(|list| list.values().cloned().collect())
                .unwrap_or_default();
            let generic: Vec<Handler> = registry.generic.values().cloned().collect();
            (specific, generic)
        };

        trace!(
            kind = %event.kind,
            origin = %event.origin,
            address = event.address.as_deref().unwrap_or(""),
            specific = specific.len(),
            generic = generic.len(),
            "raise"
        );

        for handler in specific.iter().chain(generic.iter()) {
            handler(event);
        }
    }

    /// Dispatches an event that may be missing, e.g. one decoded from a
    /// transport frame that carried `null`.
    ///
    /// A missing event is a caller error and is reported, never dropped.
    pub fn raise_checked(&self, event: Option<Event>) -> Result<(), BusError> {
        let event = event.ok_or_else(|| BusError::InvalidArgument("raise: missing event".to_string()))?;
        self.raise(&event);
        Ok(())
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.registry)
            .by_kind
            .get(&kind)
            .map_or(0, |list| list.len())
    }

    /// Number of generic handlers.
    pub fn generic_handler_count(&self) -> usize {
        lock(&self.registry).generic.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("EventBus")
            .field("kinds", &registry.by_kind.len())
            .field("generic", &registry.generic.len())
            .finish()
    }
}
