//! Typed event subscriptions with guaranteed unsubscribe.
//!
//! Every listener registration returns a [`Subscription`]. Dropping the
//! subscription detaches the listener, so a set of subscriptions collected
//! under one owner is released together when the owner goes away.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

type Callback<E> = Box<dyn FnMut(&E) + Send>;

struct Registry<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
    /// Ids unsubscribed while their callback was checked out by `emit`.
    removed: HashSet<u64>,
}

/// A list of listeners for events of type `E`.
pub struct Observers<E> {
    inner: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for Observers<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E: 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<E>(inner: &Mutex<Registry<E>>) -> MutexGuard<'_, Registry<E>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
                removed: HashSet::new(),
            })),
        }
    }

    /// Register a listener. It stays attached until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(&self, callback: impl FnMut(&E) + Send + 'static) -> Subscription {
        let id = {
            let mut reg = lock(&self.inner);
            let id = reg.next_id;
            reg.next_id += 1;
            reg.callbacks.push((id, Box::new(callback)));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut reg = lock(&inner);
                match reg.callbacks.iter().position(|(cid, _)| *cid == id) {
                    Some(pos) => {
                        reg.callbacks.remove(pos);
                    }
                    None => {
                        reg.removed.insert(id);
                    }
                }
            }
        })
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// Listeners may subscribe or unsubscribe from inside the callback.
    pub fn emit(&self, event: &E) {
        let mut active = std::mem::take(&mut lock(&self.inner).callbacks);
        for (_, callback) in active.iter_mut() {
            callback(event);
        }

        let mut reg = lock(&self.inner);
        let removed = std::mem::take(&mut reg.removed);
        active.retain(|(id, _)| !removed.contains(id));
        active.append(&mut reg.callbacks);
        reg.callbacks = active;
    }

    /// Number of attached listeners.
    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for an attached listener. Unsubscribes on drop.
#[must_use = "dropping a Subscription detaches the listener immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self { unsubscribe: Some(Box::new(unsubscribe)) }
    }

    /// Detach now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.unsubscribe.is_some())
            .finish()
    }
}
