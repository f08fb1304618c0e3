//! Events emitted by the connection pool and the cluster monitor, delivered to caller-owned
//! handler registrations. Handlers are passed in through the client options; the driver keeps
//! no global listener registry.

pub mod cmap;
pub mod sdam;

use std::sync::Arc;

/// A caller-supplied sink for events of type `E`. Handlers are invoked synchronously from
/// driver worker tasks and must not block.
pub trait EventHandler<E>: Send + Sync {
    /// Handle one event.
    fn handle(&self, event: E);
}

impl<E, F: Fn(E) + Send + Sync> EventHandler<E> for F {
    fn handle(&self, event: E) {
        self(event)
    }
}

/// A cheaply cloneable, optionally-absent handler registration.
#[derive(Clone)]
pub(crate) struct EventEmitter<E> {
    handler: Option<Arc<dyn EventHandler<E>>>,
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("registered", &self.handler.is_some())
            .finish()
    }
}

impl<E> EventEmitter<E> {
    pub(crate) fn new(handler: Option<Arc<dyn EventHandler<E>>>) -> Self {
        Self { handler }
    }

    pub(crate) fn disabled() -> Self {
        Self { handler: None }
    }

    /// Emit an event, constructing it only if a handler is registered.
    pub(crate) fn emit<F: FnOnce() -> E>(&self, make_event: F) {
        if let Some(ref handler) = self.handler {
            handler.handle(make_event());
        }
    }
}
