//! Reactive Primitives
//!
//! This module implements the atom model: atom descriptors, the store that
//! holds their values, and the accessors recipes use to read and write other
//! atoms.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An atom is a stable identity plus a recipe. Source atoms carry an initial
//! value; derived atoms carry a read recipe and, optionally, a write recipe.
//! Atoms are plain descriptors and can be shared between stores.
//!
//! ## Stores
//!
//! A store owns the values. Reading a derived atom runs its recipe once and
//! memoizes the result together with the atoms it read. Writing a source atom
//! invalidates everything derived from it, and subscribers are told about
//! every atom whose value actually changed.
//!
//! ## Getters and Setters
//!
//! Recipes never touch the store directly. A [`Getter`] records each read as
//! a dependency of the running computation; a [`Setter`] routes writes from a
//! write recipe back through the store.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: a recipe only depends on what it reads
//! through its getter, and the set is rebuilt on every computation. There is
//! no ambient tracking context to leak between unrelated reads.

mod atom;
mod context;
mod store;
mod subscriber;

pub use atom::{Atom, AtomInfo, AtomKey, AtomKind, AtomValue, Value};
pub use context::{Getter, Setter};
pub use store::{Snapshot, Store, StoreBuilder};
pub use subscriber::{Listener, ListenerId, Subscription};
