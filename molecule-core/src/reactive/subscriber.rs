//! Subscriber types for the store.
//!
//! A listener is a callback registered against one atom. It carries no
//! payload: when it fires, the owner re-reads the atom through `get`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::atom::AtomKey;
use super::store::Store;

/// A change callback.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener table keyed by atom, in registration order.
#[derive(Default)]
pub(crate) struct Listeners {
    by_atom: HashMap<AtomKey, Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    pub(crate) fn add(&mut self, key: AtomKey, id: ListenerId, listener: Listener) {
        self.by_atom.entry(key).or_default().push((id, listener));
    }

    /// Remove one listener. Returns `false` if it was not registered.
    pub(crate) fn remove(&mut self, key: AtomKey, id: ListenerId) -> bool {
        let Some(listeners) = self.by_atom.get_mut(&key) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.by_atom.remove(&key);
        }
        removed
    }

    pub(crate) fn snapshot(&self, key: AtomKey) -> Vec<Listener> {
        self.by_atom
            .get(&key)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, key: AtomKey) -> usize {
        self.by_atom.get(&key).map_or(0, Vec::len)
    }

    pub(crate) fn contains(&self, key: AtomKey) -> bool {
        self.by_atom.contains_key(&key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = AtomKey> + '_ {
        self.by_atom.keys().copied()
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle unsubscribes; [`Subscription::unsubscribe`] does the
/// same explicitly.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Store,
    key: AtomKey,
    id: Option<ListenerId>,
}

impl Subscription {
    pub(crate) fn new(store: Store, key: AtomKey, id: ListenerId) -> Self {
        Self {
            store,
            key,
            id: Some(id),
        }
    }

    /// The atom this subscription listens to.
    pub fn key(&self) -> AtomKey {
        self.key
    }

    /// Remove the listener.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.store.unsubscribe(self.key, id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
