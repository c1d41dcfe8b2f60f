//! Typed event subscriptions.

use std::sync::{Arc, Mutex, Weak};

use maple_common::lock_unpoisoned;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

/// List of handlers for events of type `E`.
pub struct Observers<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register `handler`. It stays registered until the returned
    /// [`Subscription`] is cancelled or dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = lock_unpoisoned(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push((id, Arc::new(handler)));

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock_unpoisoned(&registry)
                        .handlers
                        .retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    /// Call every handler with `event`.
    ///
    /// Handlers run outside the registry lock, so they may subscribe or
    /// cancel without deadlocking.
    pub fn notify(&self, event: &E) {
        let handlers: Vec<Handler<E>> = lock_unpoisoned(&self.registry)
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.registry).handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel handle returned by [`Observers::subscribe`].
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister the handler now.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}
