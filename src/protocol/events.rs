//! Listener registry for protocol events.
//!
//! Handlers are keyed by event name and fire in registration order. The
//! registry is scoped to one session: closing it drops every handler, and
//! nothing registered afterwards is kept.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handler for a named event.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handler for every event, receiving the event name as well.
pub type AnyEventHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle returned by a registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    handler: EventHandler,
    once: bool,
}

struct AnyListener {
    id: ListenerId,
    handler: AnyEventHandler,
}

#[derive(Default)]
struct Listeners {
    by_event: HashMap<String, Vec<Listener>>,
    any: Vec<AnyListener>,
}

/// Publish/subscribe registry for one session's events.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    closed: AtomicBool,
    inner: Mutex<Listeners>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, event: &str, handler: EventHandler, once: bool) -> ListenerId {
        let id = self.allocate_id();
        if self.is_closed() {
            return id;
        }
        self.lock()
            .by_event
            .entry(event.to_string())
            .or_default()
            .push(Listener { id, handler, once });
        id
    }

    /// Register a handler for every occurrence of `event`.
    pub fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        self.add(event, handler, false)
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once(&self, event: &str, handler: EventHandler) -> ListenerId {
        self.add(event, handler, true)
    }

    /// Register a handler for all events.
    pub fn on_any(&self, handler: AnyEventHandler) -> ListenerId {
        let id = self.allocate_id();
        if !self.is_closed() {
            self.lock().any.push(AnyListener { id, handler });
        }
        id
    }

    /// Remove a registration. Returns false if it was not (or no longer) registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        for listeners in inner.by_event.values_mut() {
            if let Some(pos) = listeners.iter().position(|l| l.id == id) {
                listeners.remove(pos);
                return true;
            }
        }
        if let Some(pos) = inner.any.iter().position(|l| l.id == id) {
            inner.any.remove(pos);
            return true;
        }
        false
    }

    /// Deliver an event to its handlers in registration order.
    ///
    /// Handlers run outside the registry lock so they may register or remove
    /// listeners themselves.
    pub fn emit(&self, event: &str, params: &Value) {
        if self.is_closed() {
            return;
        }

        let (named, any): (Vec<EventHandler>, Vec<AnyEventHandler>) = {
            let mut inner = self.lock();
            let named = match inner.by_event.get_mut(event) {
                Some(listeners) => {
                    let handlers = listeners.iter().map(|l| l.handler.clone()).collect();
                    listeners.retain(|l| !l.once);
                    handlers
                }
                None => Vec::new(),
            };
            let any = inner.any.iter().map(|l| l.handler.clone()).collect();
            (named, any)
        };

        for handler in named {
            if self.is_closed() {
                return;
            }
            handler(params);
        }
        for handler in any {
            if self.is_closed() {
                return;
            }
            handler(event, params);
        }
    }

    /// Number of handlers registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().by_event.get(event).map_or(0, Vec::len)
    }

    /// Total number of registrations, including wildcard ones.
    pub fn total_listener_count(&self) -> usize {
        let inner = self.lock();
        inner.by_event.values().map(Vec::len).sum::<usize>() + inner.any.len()
    }

    /// Drop every handler and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.lock();
        inner.by_event.clear();
        inner.any.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
