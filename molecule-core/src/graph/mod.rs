//! Computation Graph
//!
//! This module owns the memoized side of the runtime: the per-atom cache and
//! the dependency graph recorded alongside it.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are atoms with a cached value
//! - Edges are dependencies: if B read A during its last computation, there
//!   is an edge from A to B
//!
//! Edges are stored twice. Each cache entry keeps the set of atoms it read
//! (forward edges) and the cache keeps a reverse index from each atom to the
//! entries that read it. The reverse index drives the invalidation cascade
//! when a source atom is written.
//!
//! # Design Decisions
//!
//! 1. Invalidation is push-based: a write removes every transitively
//!    dependent entry before it returns. Reads never have to re-walk
//!    dependencies to check for staleness.
//!
//! 2. The cache is bounded by entry count (LRU) and by idle age (sweep).
//!    Removal of an entry only ever drops a value; the atom's identity and
//!    recipe are untouched, so the next read rebuilds it.
//!
//! 3. Follow-up work after a cascade is ordered topologically, so the order
//!    in which subscribers are notified does not depend on hash-set layout.

mod cache;
mod scheduler;

pub use cache::CacheEntry;

pub(crate) use cache::{ComputationCache, Invalidated};
pub(crate) use scheduler::schedule;
