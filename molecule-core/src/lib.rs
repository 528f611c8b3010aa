//! Molecule Core
//!
//! This crate provides the core runtime for Molecule, an atom-based state
//! store with automatic dependency tracking. It implements:
//!
//! - Atom descriptors (source, derived, and writable derived atoms)
//! - A store with memoized reads, change-suppressed writes, subscriptions,
//!   and batched notifications
//! - A bounded computation cache with an invalidation cascade
//! - A middleware pipeline, with logging, persistence, and write history
//!   interceptors
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Atoms, the store, and the getter/setter accessors
//! - `graph`: Computation cache, dependency edges, and cascade ordering
//! - `middleware`: Interceptor trait and the bundled interceptors
//! - `config`: Store tuning, loadable from JSON
//! - `error`: Error types shared by every operation
//!
//! # Example
//!
//! ```rust,ignore
//! use molecule_core::{Atom, Store};
//!
//! // Create a source atom
//! let count = Atom::new(0);
//!
//! // Create a derived atom
//! let doubled = Atom::derived({
//!     let count = count.clone();
//!     move |get| Ok(get.get(&count)? * 2)
//! });
//!
//! let store = Store::new();
//! let _sub = store.subscribe(&doubled, || println!("doubled changed"))?;
//!
//! // Update the source
//! store.set(&count, 5)?;
//! // Listener runs once, and doubled now reads 10
//! assert_eq!(store.get(&doubled)?, 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod middleware;
pub mod reactive;

pub use config::StoreConfig;
pub use error::{AtomError, ConfigError, Result};
pub use graph::CacheEntry;
pub use middleware::{Middleware, Next};
pub use reactive::{
    Atom, AtomInfo, AtomKey, AtomKind, AtomValue, Getter, Setter, Snapshot, Store, StoreBuilder,
    Subscription, Value,
};
