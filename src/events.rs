use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

/// Topics published on the process-wide bus.
pub mod topics {
    /// Graceful-shutdown request; the runner answers by sending `quit` upstream.
    pub const QUIT: &str = "hatchling:quit";
    pub const REQUEST_SUCCESS: &str = "request_success";
    pub const REQUEST_FAILURE: &str = "request_failure";
}

/// Payload delivered to subscribers. Response times are milliseconds.
#[derive(Debug, Clone)]
pub enum Event {
    RequestSuccess {
        method: String,
        name: String,
        response_time: i64,
        content_length: i64,
    },
    RequestFailure {
        method: String,
        name: String,
        response_time: i64,
        error: String,
    },
    Quit,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Synchronous topic-based publish/subscribe registry. Handlers run in the
/// publisher's context, so they must not block.
pub struct EventBus {
    handlers: Mutex<HashMap<&'static str, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, topic: &'static str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = match self.handlers.lock() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, topic: &'static str, id: SubscriptionId) {
        let mut handlers = match self.handlers.lock() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(subscribers) = handlers.get_mut(topic) {
            subscribers.retain(|(subscriber_id, _)| *subscriber_id != id);
        }
    }

    pub fn publish(&self, topic: &'static str, event: &Event) {
        // Clone the handler list out of the lock so a handler may publish
        // or (un)subscribe without deadlocking.
        let subscribers: Vec<Handler> = {
            let handlers = match self.handlers.lock() {
                Ok(handlers) => handlers,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers
                .get(topic)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect()
                })
                .unwrap_or_default()
        };
        for handler in subscribers {
            handler(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

static EVENTS: Lazy<EventBus> = Lazy::new(EventBus::new);

/// The process-wide event bus.
#[must_use]
pub fn events() -> &'static EventBus {
    &EVENTS
}
