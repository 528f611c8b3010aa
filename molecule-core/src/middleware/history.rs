//! Write history for debugging tools.
//!
//! [`History`] records every write that passes through the pipeline and
//! periodically captures a [`Snapshot`] of the whole store. A debugger can
//! list the records, jump the store back to any captured snapshot, or reset
//! everything.

use std::fmt;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::debug;

use super::{Middleware, Next};
use crate::error::{AtomError, Result};
use crate::reactive::{AtomInfo, AtomKey, AtomKind, Snapshot, Store, Value};

/// Default number of records between two snapshots.
const SNAPSHOT_EVERY: usize = 50;

/// One recorded write.
#[derive(Clone)]
pub struct HistoryRecord {
    atom: AtomKey,
    label: Option<String>,
    kind: AtomKind,
    value: Value,
    at: SystemTime,
}

impl HistoryRecord {
    /// The atom that was written.
    pub fn atom(&self) -> AtomKey {
        self.atom
    }

    /// The atom's debug label at the time of the write.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Recipe shape of the written atom.
    pub fn kind(&self) -> AtomKind {
        self.kind
    }

    /// The written value, if it has type `T`.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Wall-clock time of the write.
    pub fn at(&self) -> SystemTime {
        self.at
    }
}

impl fmt::Debug for HistoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryRecord")
            .field("atom", &self.atom)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("at", &self.at)
            .finish_non_exhaustive()
    }
}

/// A store snapshot taken after `records` writes had been recorded.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    /// Number of recorded writes when the snapshot was taken.
    pub records: usize,
    /// Every cached value at that point.
    pub snapshot: Snapshot,
}

#[derive(Default)]
struct Recorded {
    records: Vec<HistoryRecord>,
    snapshots: Vec<HistorySnapshot>,
}

/// Middleware recording writes and periodic snapshots.
///
/// Share it with the store through an `Arc` to query it afterwards:
///
/// ```rust,ignore
/// let history = Arc::new(History::new());
/// let store = Store::builder().middleware(history.clone()).build()?;
/// // ...
/// history.jump_to(&store, 0)?;
/// ```
pub struct History {
    every: usize,
    recorded: Mutex<Recorded>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    /// Snapshot every 50 records.
    pub fn new() -> Self {
        Self::with_interval(SNAPSHOT_EVERY)
    }

    /// Snapshot every `every` records (at least 1).
    pub fn with_interval(every: usize) -> Self {
        Self {
            every: every.max(1),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Get all recorded writes, oldest first.
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.recorded.lock().records.clone()
    }

    /// Get all snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<HistorySnapshot> {
        self.recorded.lock().snapshots.clone()
    }

    /// Get the number of recorded writes.
    pub fn len(&self) -> usize {
        self.recorded.lock().records.len()
    }

    /// Check if no writes have been recorded.
    pub fn is_empty(&self) -> bool {
        self.recorded.lock().records.is_empty()
    }

    /// Restore `store` to snapshot `index`.
    ///
    /// Source atoms take the captured values; derived atoms recompute. The
    /// jump itself is not recorded.
    pub fn jump_to(&self, store: &Store, index: usize) -> Result<()> {
        let target = self
            .recorded
            .lock()
            .snapshots
            .get(index)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| AtomError::failed(format!("no history snapshot at index {index}")))?;

        debug!(index, atoms = target.len(), "jumping to history snapshot");
        store.restore(&target)
    }

    /// Forget all records and snapshots and clear the store's cache.
    pub fn reset(&self, store: &Store) {
        {
            let mut recorded = self.recorded.lock();
            recorded.records.clear();
            recorded.snapshots.clear();
        }
        debug!("history reset");
        store.clear();
    }
}

impl Middleware for History {
    fn on_write(&self, atom: &AtomInfo, value: Value, next: Next<'_>) -> Result<()> {
        let store = next.store();
        let written = Value::clone(&value);
        next.run(value)?;

        let count = {
            let mut recorded = self.recorded.lock();
            recorded.records.push(HistoryRecord {
                atom: atom.key(),
                label: atom.label().map(str::to_owned),
                kind: atom.kind(),
                value: written,
                at: SystemTime::now(),
            });
            recorded.records.len()
        };

        if count % self.every == 0 {
            let snapshot = store.snapshot();
            debug!(records = count, atoms = snapshot.len(), "history snapshot");
            self.recorded.lock().snapshots.push(HistorySnapshot {
                records: count,
                snapshot,
            });
        }
        Ok(())
    }
}
