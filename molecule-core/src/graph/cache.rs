//! Computation Cache
//!
//! Memoized values per atom, the recorded dependency set of each value, and
//! the reverse index (dependency -> dependents) used for the invalidation
//! cascade.
//!
//! # Reverse Index
//!
//! The reverse index mentions atoms that are cached, plus subscribed atoms
//! whose last computation failed. Storing an entry attaches its edges;
//! removing an entry for any reason (invalidation, eviction, reclamation)
//! detaches them. Replacing an entry swaps the edge set wholesale, so edges
//! of an earlier computation never linger.
//!
//! A subscribed atom that fails to compute is *parked*: the reads it made
//! before failing stay attached without a value, so the next upstream change
//! still reaches it and it can recover.
//!
//! # Versions
//!
//! A version advances only when a stored value differs from the previous one.
//! Invalidation keeps the removed value around as the comparison point for
//! the next computation; reclamation drops it.
//!
//! # Eviction
//!
//! At capacity the least recently accessed *evictable* entry is dropped. An
//! entry is evictable when nothing pins it (no subscribers), it is not a
//! source atom holding a written value, and no cached entry depends on it.
//! Removing such an entry can never strand a dependent with a stale value, so
//! eviction needs no cascade.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use tracing::{trace, warn};

use crate::reactive::{AtomKey, Value};

/// A memoized value and the facts recorded when it was computed.
#[derive(Clone)]
pub struct CacheEntry {
    value: Value,
    dependencies: IndexSet<AtomKey>,
    last_accessed: Instant,
    tick: u64,
    version: u64,
    compute_time: Duration,
}

impl CacheEntry {
    /// The cached value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Atoms read by the computation that produced this value.
    pub fn dependencies(&self) -> &IndexSet<AtomKey> {
        &self.dependencies
    }

    /// When the entry was last stored or looked up.
    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    /// Time since the entry was last stored or looked up.
    pub fn age(&self) -> Duration {
        self.last_accessed.elapsed()
    }

    /// Number of stored values for this atom that differed from their
    /// predecessor.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// How long the producing computation took.
    pub fn compute_time(&self) -> Duration {
        self.compute_time
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("dependencies", &self.dependencies)
            .field("version", &self.version)
            .field("compute_time", &self.compute_time)
            .finish_non_exhaustive()
    }
}

/// An entry removed by an invalidation cascade. Parked atoms have no value.
pub(crate) struct Invalidated {
    pub key: AtomKey,
    pub value: Option<Value>,
    pub dependencies: IndexSet<AtomKey>,
}

/// Per-store memo table with a bounded size.
pub(crate) struct ComputationCache {
    entries: IndexMap<AtomKey, CacheEntry>,
    dependents: HashMap<AtomKey, IndexSet<AtomKey>>,
    /// Subscriber counts per atom.
    pins: HashMap<AtomKey, usize>,
    /// Source atoms whose value was written and must survive eviction.
    held: HashSet<AtomKey>,
    /// Last version per atom; survives removal so versions stay monotonic.
    versions: HashMap<AtomKey, u64>,
    /// Values removed by invalidation, with the time they were removed.
    retired: HashMap<AtomKey, (Value, Instant)>,
    /// Subscribed atoms whose computation failed, with the reads it made.
    parked: IndexMap<AtomKey, IndexSet<AtomKey>>,
    capacity: usize,
    tick: u64,
}

impl ComputationCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            dependents: HashMap::new(),
            pins: HashMap::new(),
            held: HashSet::new(),
            versions: HashMap::new(),
            retired: HashMap::new(),
            parked: IndexMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Return the cached value and refresh its access time.
    pub(crate) fn lookup(&mut self, key: AtomKey) -> Option<Value> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(&key)?;
        entry.last_accessed = Instant::now();
        entry.tick = tick;
        Some(Value::clone(&entry.value))
    }

    /// Read an entry without touching its access time.
    pub(crate) fn peek(&self, key: AtomKey) -> Option<&CacheEntry> {
        self.entries.get(&key)
    }

    /// The value a new computation of `key` should be compared against: the
    /// live entry, or the one last removed by invalidation.
    pub(crate) fn previous(&self, key: AtomKey) -> Option<Value> {
        self.entries
            .get(&key)
            .map(|entry| Value::clone(&entry.value))
            .or_else(|| self.retired.get(&key).map(|(value, _)| Value::clone(value)))
    }

    /// Insert or replace the entry for `key`.
    ///
    /// `changed` tells whether the value differs from [`previous`](Self::previous);
    /// it decides whether the version advances. Returns the keys evicted to
    /// make room.
    pub(crate) fn store(
        &mut self,
        key: AtomKey,
        value: Value,
        dependencies: IndexSet<AtomKey>,
        compute_time: Duration,
        changed: bool,
    ) -> Vec<AtomKey> {
        let mut evicted = Vec::new();
        self.retired.remove(&key);
        if let Some(parked) = self.parked.shift_remove(&key) {
            self.detach(key, &parked);
        }

        if let Some(previous) = self.entries.get(&key) {
            let old = previous.dependencies.clone();
            self.detach(key, &old);
        } else {
            while self.entries.len() >= self.capacity {
                match self.lru_candidate() {
                    Some(victim) => {
                        trace!(atom = %victim, "evicting least recently used entry");
                        self.remove(victim);
                        evicted.push(victim);
                    }
                    None => {
                        warn!(
                            capacity = self.capacity,
                            "cache over capacity: every entry is pinned or depended upon"
                        );
                        break;
                    }
                }
            }
        }

        let version = self.versions.entry(key).or_insert(0);
        if changed {
            *version += 1;
        }
        let version = *version;

        for dependency in &dependencies {
            self.dependents.entry(*dependency).or_default().insert(key);
        }

        let tick = self.next_tick();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                dependencies,
                last_accessed: Instant::now(),
                tick,
                version,
                compute_time,
            },
        );

        evicted
    }

    /// Remove one entry and its reverse-index edges. Dependents are left
    /// alone; use [`invalidate`](Self::invalidate) for a cascade.
    pub(crate) fn remove(&mut self, key: AtomKey) -> Option<CacheEntry> {
        self.retired.remove(&key);
        self.take(key)
    }

    fn take(&mut self, key: AtomKey) -> Option<CacheEntry> {
        let entry = self.entries.shift_remove(&key)?;
        self.detach(key, &entry.dependencies);
        Some(entry)
    }

    /// Keep the reads of a failed computation attached so the next change
    /// to any of them reaches `key`. Only subscribed atoms are parked.
    pub(crate) fn park(&mut self, key: AtomKey, dependencies: IndexSet<AtomKey>) {
        if !self.pins.contains_key(&key) || self.entries.contains_key(&key) {
            return;
        }
        if let Some(old) = self.parked.shift_remove(&key) {
            self.detach(key, &old);
        }
        for dependency in &dependencies {
            self.dependents.entry(*dependency).or_default().insert(key);
        }
        trace!(atom = %key, reads = dependencies.len(), "parked failed computation");
        self.parked.insert(key, dependencies);
    }

    fn unpark(&mut self, key: AtomKey) -> Option<IndexSet<AtomKey>> {
        let dependencies = self.parked.shift_remove(&key)?;
        self.detach(key, &dependencies);
        Some(dependencies)
    }

    fn detach(&mut self, key: AtomKey, dependencies: &IndexSet<AtomKey>) {
        for dependency in dependencies {
            if let Some(dependents) = self.dependents.get_mut(dependency) {
                dependents.shift_remove(&key);
                if dependents.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
    }

    /// Remove `root` (when `include_root`) and every cached or parked atom
    /// that transitively depends on it.
    ///
    /// Entries come back in discovery order with their recorded dependencies
    /// so the caller can order follow-up work.
    pub(crate) fn invalidate(&mut self, root: AtomKey, include_root: bool) -> Vec<Invalidated> {
        let mut removed = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root];

        while let Some(key) = stack.pop() {
            if !visited.insert(key) {
                continue;
            }

            let next: Vec<AtomKey> = self
                .dependents
                .get(&key)
                .map(|dependents| dependents.iter().copied().collect())
                .unwrap_or_default();

            if key != root || include_root {
                if let Some(entry) = self.take(key) {
                    self.retired
                        .insert(key, (Value::clone(&entry.value), Instant::now()));
                    removed.push(Invalidated {
                        key,
                        value: Some(entry.value),
                        dependencies: entry.dependencies,
                    });
                } else if let Some(dependencies) = self.unpark(key) {
                    removed.push(Invalidated {
                        key,
                        value: None,
                        dependencies,
                    });
                }
            }

            stack.extend(next.into_iter().rev());
        }

        removed
    }

    /// Remove every entry, returning them as if invalidated. Subscriber pins
    /// are kept; written-source holds are released.
    pub(crate) fn clear(&mut self) -> Vec<Invalidated> {
        self.dependents.clear();
        self.held.clear();

        let now = Instant::now();
        let mut removed = Vec::with_capacity(self.entries.len() + self.parked.len());
        for (key, entry) in self.entries.drain(..) {
            self.retired.insert(key, (Value::clone(&entry.value), now));
            removed.push(Invalidated {
                key,
                value: Some(entry.value),
                dependencies: entry.dependencies,
            });
        }
        for (key, dependencies) in self.parked.drain(..) {
            removed.push(Invalidated {
                key,
                value: None,
                dependencies,
            });
        }
        removed
    }

    /// Reclaim evictable entries idle for at least `max_age`.
    ///
    /// Runs to a fixed point: removing an idle dependent can make its idle
    /// dependencies evictable in turn.
    pub(crate) fn sweep(&mut self, now: Instant, max_age: Duration) -> Vec<AtomKey> {
        self.retired
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < max_age);

        let mut reclaimed = Vec::new();
        loop {
            let expired: Vec<AtomKey> = self
                .entries
                .iter()
                .filter(|(key, entry)| {
                    now.saturating_duration_since(entry.last_accessed) >= max_age
                        && self.is_evictable(**key)
                })
                .map(|(key, _)| *key)
                .collect();

            if expired.is_empty() {
                return reclaimed;
            }
            for key in expired {
                self.remove(key);
                reclaimed.push(key);
            }
        }
    }

    fn lru_candidate(&self) -> Option<AtomKey> {
        self.entries
            .iter()
            .filter(|(key, _)| self.is_evictable(**key))
            .min_by_key(|(_, entry)| entry.tick)
            .map(|(key, _)| *key)
    }

    /// Whether removing `key` is safe without a cascade.
    pub(crate) fn is_evictable(&self, key: AtomKey) -> bool {
        !self.pins.contains_key(&key)
            && !self.held.contains(&key)
            && self
                .dependents
                .get(&key)
                .map_or(true, |dependents| dependents.is_empty())
    }

    /// Whether `key` is cached and idle for at least `max_age`.
    pub(crate) fn is_stale(&self, key: AtomKey, now: Instant, max_age: Duration) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|entry| now.saturating_duration_since(entry.last_accessed) >= max_age)
    }

    pub(crate) fn pin(&mut self, key: AtomKey) {
        *self.pins.entry(key).or_insert(0) += 1;
    }

    pub(crate) fn unpin(&mut self, key: AtomKey) {
        if let Some(count) = self.pins.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&key);
                self.unpark(key);
            }
        }
    }

    /// Keep a written source value resident.
    pub(crate) fn hold(&mut self, key: AtomKey) {
        self.held.insert(key);
    }

    pub(crate) fn contains(&self, key: AtomKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Cached atoms recorded as reading `key`.
    pub(crate) fn dependents_of(&self, key: AtomKey) -> Vec<AtomKey> {
        self.dependents
            .get(&key)
            .map(|dependents| {
                dependents
                    .iter()
                    .copied()
                    .filter(|dependent| self.entries.contains_key(dependent))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (AtomKey, &CacheEntry)> {
        self.entries.iter().map(|(key, entry)| (*key, entry))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
