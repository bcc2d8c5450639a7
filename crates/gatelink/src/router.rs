//! Inbound event routing.
//!
//! Reserved control events are intercepted and handed back to the driver; all
//! other events fan out to every handler registered for their type. Dispatch runs
//! over a snapshot of the handler list, so a handler may register or remove
//! handlers (including itself) while being called.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gatelink_proto::{ControlMessage, Frame};
use parking_lot::RwLock;
use tracing::{trace, warn};

/// Result returned by an event handler.
pub type HandlerResult = Result<(), Box<dyn StdError + Send + Sync>>;

type Handler = Arc<dyn Fn(&Frame) -> HandlerResult + Send + Sync>;

/// Token identifying a registered handler, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Outcome of routing one application event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned `Err` or panicked.
    pub failed: usize,
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Reserved event for the connection itself.
    Control(ControlMessage),
    /// Application event delivered to handlers.
    Dispatched(DispatchReport),
}

/// Registry of handlers keyed by event type.
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(event_type, list)| (event_type.as_str(), list.len()))
            .collect();
        f.debug_struct("EventRouter")
            .field("handlers", &counts)
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event_type`.
    ///
    /// Handlers registered for reserved control types are accepted but never
    /// called.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Frame) -> HandlerResult + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event_type = event_type.into();
        if gatelink_proto::control::is_reserved(&event_type) {
            warn!(event_type = %event_type, "Handler registered for a reserved control event will never fire");
        }
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered for `event_type`.
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event_type);
        }
        removed
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.read().get(event_type).map_or(0, Vec::len)
    }

    /// Route a decoded frame.
    pub fn route(&self, frame: &Frame) -> Route {
        if let Some(control) = ControlMessage::from_frame(frame) {
            return Route::Control(control);
        }
        Route::Dispatched(self.dispatch(frame))
    }

    fn dispatch(&self, frame: &Frame) -> DispatchReport {
        // The lock is released before any handler runs.
        let snapshot: Vec<(HandlerId, Handler)> = self
            .handlers
            .read()
            .get(&frame.event_type)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            trace!(event_type = %frame.event_type, "No handlers for event");
        }

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(event_type = %frame.event_type, handler = id.0, error = %e, "Event handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(event_type = %frame.event_type, handler = id.0, "Event handler panicked");
                }
            }
        }
        report
    }
}
