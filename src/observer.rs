//! Callback registries for log-arrival and connection-state subscriptions.
//!
//! Handlers are stored behind a short mutex and invoked outside it, so a
//! handler may freely re-enter the manager. A panicking handler is isolated
//! from the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub(crate) struct Registry<H: ?Sized> {
    handlers: Arc<Mutex<HashMap<u64, Arc<H>>>>,
    next_id: AtomicU64,
}

impl<H: ?Sized> Registry<H> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn insert(&self, handler: Arc<H>) -> Subscription
    where
        H: Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.handlers.lock() {
            map.insert(id, handler);
        }
        let slot: Weak<Mutex<HashMap<u64, Arc<H>>>> = Arc::downgrade(&self.handlers);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(handlers) = slot.upgrade() {
                    if let Ok(mut map) = handlers.lock() {
                        map.remove(&id);
                    }
                }
            })),
        }
    }

    /// Snapshot of the registered handlers, for invocation outside the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<H>> {
        self.handlers
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// Handle returned by `on_log`/`on_connection`.
///
/// Dropping the handle leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
