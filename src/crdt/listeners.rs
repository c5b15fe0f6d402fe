//! A small pub/sub registry shared by [`super::DocumentStore`]'s delta and
//! raw-update subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Dropping this unregisters the listener it was returned for.
pub struct Unsubscribe {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

pub struct ListenerSet<T> {
    next_id: Arc<AtomicU64>,
    listeners: Arc<Mutex<HashMap<u64, Listener<T>>>>,
}

impl<T> Clone for ListenerSet<T> {
    fn clone(&self) -> Self {
        Self {
            next_id: self.next_id.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<T> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(0)),
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, Box::new(listener));
        }
        let listeners = self.listeners.clone();
        Unsubscribe {
            remove: Some(Box::new(move || {
                if let Ok(mut listeners) = listeners.lock() {
                    listeners.remove(&id);
                }
            })),
        }
    }

    pub fn notify(&self, value: &T) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.values() {
                listener(value);
            }
        }
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
