//! Handler registry for inbound event dispatch.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use postbox_core::Event;

/// Application callback invoked for each claimed inbox event.
///
/// A returned error marks the event as failed; there is no retry at this
/// layer, so handlers should retry internally if they need to.
pub trait Handler: Send + Sync + 'static {
    /// Processes one inbound event.
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        Box::pin((self.0)(event))
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Maps event type names to their handlers.
///
/// The registry is fixed at construction; the consumer scheduler never
/// mutates it while running.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an event type, replacing any previous one.
    #[must_use]
    pub fn with_handler(mut self, event_type: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    /// Looks up the handler for an event type.
    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(event_type)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
