//! Dependency Tracking
//!
//! While a read recipe runs, every nested `get` goes through a [`Getter`]
//! that records the atom being read. The recorded set becomes the complete
//! dependency set of the computation; it replaces whatever the previous
//! computation recorded, so a recipe that branches drops the edges of the
//! branch it no longer follows.
//!
//! # Cycle Detection
//!
//! The store keeps an access stack of the atoms currently being computed.
//! Entering an atom that is already on the stack closes a cycle (this covers
//! self-reference too), and the stack depth is bounded to catch pathological
//! chains. Each entry is owned by a [`Frame`] guard that pops it on every exit
//! path, including errors and panics, so a failed computation never poisons
//! later cycle checks.

use std::cell::RefCell;

use indexmap::IndexSet;
use smallvec::SmallVec;
use tracing::warn;

use super::atom::{Atom, AtomKey, AtomValue};
use super::store::Store;
use crate::error::{AtomError, Result};

/// The atoms currently being computed, outermost first.
#[derive(Debug, Default)]
pub(crate) struct AccessStack {
    frames: SmallVec<[AtomKey; 16]>,
}

impl AccessStack {
    /// Push `key`, failing if it closes a cycle or exceeds `max_depth`.
    pub(crate) fn push(&mut self, key: AtomKey, max_depth: usize) -> Result<()> {
        if self.frames.contains(&key) {
            warn!(atom = %key, depth = self.frames.len(), "circular dependency detected");
            return Err(self.cycle(key));
        }
        if self.frames.len() >= max_depth {
            warn!(atom = %key, max_depth, "maximum dependency depth exceeded");
            return Err(self.cycle(key));
        }
        self.frames.push(key);
        Ok(())
    }

    fn cycle(&self, key: AtomKey) -> AtomError {
        let mut path: Vec<AtomKey> = self.frames.to_vec();
        path.push(key);
        AtomError::CircularDependency { atom: key, path }
    }

    pub(crate) fn pop(&mut self) -> Option<AtomKey> {
        self.frames.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Guard for one entry on the store's access stack.
pub(crate) struct Frame<'a> {
    store: &'a Store,
    key: AtomKey,
}

impl<'a> Frame<'a> {
    pub(crate) fn enter(store: &'a Store, key: AtomKey) -> Result<Self> {
        let max_depth = store.config().max_depth;
        store.with_state(|state| state.stack.push(key, max_depth))?;
        Ok(Self { store, key })
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let popped = self.store.with_state(|state| state.stack.pop());

        if !std::thread::panicking() {
            debug_assert_eq!(
                popped,
                Some(self.key),
                "access stack mismatch: expected {:?}, got {:?}",
                self.key,
                popped
            );
        }
    }
}

/// Accessor handed to read and write recipes.
///
/// Reads made through a getter are recorded as dependencies of the
/// computation that owns it.
pub struct Getter<'a> {
    store: &'a Store,
    dependencies: RefCell<IndexSet<AtomKey>>,
}

impl<'a> Getter<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self {
            store,
            dependencies: RefCell::new(IndexSet::new()),
        }
    }

    /// Read an atom, recording it as a dependency.
    pub fn get<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T> {
        self.dependencies.borrow_mut().insert(atom.key());
        self.store.read_atom(atom)
    }

    /// The atoms read so far, in first-read order.
    pub fn dependencies(&self) -> Vec<AtomKey> {
        self.dependencies.borrow().iter().copied().collect()
    }

    pub(crate) fn into_dependencies(self) -> IndexSet<AtomKey> {
        self.dependencies.into_inner()
    }
}

/// Accessor handed to write recipes for updating atoms.
pub struct Setter<'a> {
    store: &'a Store,
    target: AtomKey,
}

impl<'a> Setter<'a> {
    pub(crate) fn new(store: &'a Store, target: AtomKey) -> Self {
        Self { store, target }
    }

    /// Write `value` to `atom`.
    ///
    /// Writing the atom that owns the recipe assigns its value directly,
    /// which is only possible for source atoms. Any other atom goes through
    /// the full write path, middleware included.
    pub fn set<T: AtomValue>(&self, atom: &Atom<T>, value: T) -> Result<()> {
        if atom.key() == self.target {
            return self.store.assign_own(atom, value);
        }
        self.store.write_atom(atom, |_| Ok(value))
    }

    /// Write the result of applying `f` to the atom's current value.
    pub fn update<T, F>(&self, atom: &Atom<T>, f: F) -> Result<()>
    where
        T: AtomValue,
        F: FnOnce(&T) -> T,
    {
        if atom.key() == self.target {
            let next = f(&self.store.current(atom)?);
            return self.store.assign_own(atom, next);
        }
        self.store.write_atom(atom, |store| store.current(atom).map(|prev| f(&prev)))
    }
}
