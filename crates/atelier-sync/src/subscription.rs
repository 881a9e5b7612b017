//! Subscriber registry for store updates.
//!
//! An explicit registry object handed to both registrant and dispatcher,
//! never a process-wide singleton. Handlers run synchronously inside the
//! consumption loop's thread of control; a panicking handler is isolated at
//! the dispatch boundary and must not take the loop down with it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use atelier_proto::StreamEvent;

type Handler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

struct Registered {
    id: u64,
    session_id: Option<String>,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Registered>,
}

/// Handler registry. Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<Inner>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every event.
    pub fn subscribe(&self, handler: impl Fn(&StreamEvent) + Send + Sync + 'static) -> Subscription {
        self.register(None, Arc::new(handler))
    }

    /// Register a handler for events scoped to one session. Events without a
    /// session scope (heartbeats, sync snapshots) are not delivered here.
    pub fn subscribe_session(
        &self,
        session_id: impl Into<String>,
        handler: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(session_id.into()), Arc::new(handler))
    }

    fn register(&self, session_id: Option<String>, handler: Handler) -> Subscription {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(Registered {
            id,
            session_id,
            handler,
        });
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Dispatch one event to every matching handler. Handlers are invoked
    /// outside the registry lock so a handler may subscribe/unsubscribe
    /// without deadlocking.
    pub fn dispatch(&self, event: &StreamEvent) {
        let matching: Vec<Handler> = {
            let inner = lock(&self.inner);
            inner
                .entries
                .iter()
                .filter(|entry| match entry.session_id.as_deref() {
                    None => true,
                    Some(scope) => event.session_id() == Some(scope),
                })
                .map(|entry| Arc::clone(&entry.handler))
                .collect()
        };

        for handler in matching {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                tracing::error!(event = %event.name(), detail = %detail, "Subscriber panicked during dispatch");
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

/// Unsubscribe capability returned by the registry. Dropping it (or calling
/// [`Subscription::unsubscribe`]) deregisters the handler.
pub struct Subscription {
    registry: Weak<Mutex<Inner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).entries.retain(|entry| entry.id != self.id);
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn idle_event(session_id: &str) -> StreamEvent {
        StreamEvent::SessionIdle {
            session_id: session_id.to_owned(),
        }
    }

    #[test]
    fn session_scoped_handler_only_sees_its_session() {
        let subscribers = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _sub = subscribers.subscribe_session("ses_1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        subscribers.dispatch(&idle_event("ses_1"));
        subscribers.dispatch(&idle_event("ses_2"));
        subscribers.dispatch(&StreamEvent::ServerHeartbeat { retry_ms: None });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let subscribers = Subscribers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sub = subscribers.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        subscribers.dispatch(&idle_event("ses_1"));
        sub.unsubscribe();
        subscribers.dispatch(&idle_event("ses_1"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn panicking_handler_does_not_starve_later_ones() {
        let subscribers = Subscribers::new();
        let _bad = subscribers.subscribe(|_| panic!("handler bug"));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _good = subscribers.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        subscribers.dispatch(&idle_event("ses_1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
