//! Store
//!
//! The store is the central coordinator. It owns the computation cache, the
//! listener table, and the middleware pipeline, and exposes the four public
//! operations: `get`, `set`, `subscribe`, and `batch`.
//!
//! # How It Works
//!
//! 1. `get` enters the atom on the access stack, returns the cached value or
//!    runs the read recipe through a [`Getter`], records the dependencies it
//!    read, and passes the result through `on_read` middleware.
//!
//! 2. `set` resolves the update, runs `on_write` middleware, and then either
//!    assigns a source atom or runs a write recipe. Assigning a value that
//!    differs from the cached one invalidates every transitively dependent
//!    entry before the call returns.
//!
//! 3. Invalidated atoms that have subscribers are recomputed in dependency
//!    order and compared with their old value; only atoms whose value
//!    actually changed are queued for notification.
//!
//! 4. Notifications are delivered when the outermost batch closes. Every
//!    `set` runs as a batch of its own, so nested batches simply collapse into
//!    the outermost one and each changed atom is notified once.
//!
//! # Thread Safety
//!
//! All public operations serialise on one re-entrant lock. The owning thread
//! may re-enter (a recipe calling `get`, a listener calling `set`); other
//! threads wait. Mutable state sits in a `RefCell` behind that lock and is
//! never borrowed while caller code runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use super::atom::{Atom, AtomKey, AtomKind, AtomValue, ErasedAtom, Value};
use super::context::{AccessStack, Frame, Getter, Setter};
use super::subscriber::{Listener, ListenerId, Listeners, Subscription};
use crate::config::StoreConfig;
use crate::error::{AtomError, ConfigError, Result};
use crate::graph::{self, CacheEntry, ComputationCache, Invalidated};
use crate::middleware::{Middleware, Pipeline};

/// Mutable store state, guarded by the store lock.
pub(crate) struct State {
    pub(crate) stack: AccessStack,
    cache: ComputationCache,
    /// Every atom this store has materialised, for key-addressed operations.
    registry: HashMap<AtomKey, Arc<dyn ErasedAtom>>,
    listeners: Listeners,
    /// Atoms changed inside the current batch, in first-change order.
    pending: IndexSet<AtomKey>,
    batch_depth: usize,
    calls: usize,
    /// Call depth at which the listener being notified was invoked. Calls a
    /// listener makes count as outermost relative to it.
    call_floor: usize,
    last_sweep: Instant,
}

struct StoreInner {
    config: StoreConfig,
    pipeline: Pipeline,
    state: ReentrantMutex<RefCell<State>>,
}

/// A container for atom values.
///
/// Cloning a store clones the handle; all clones share the same cache and
/// listeners. Separate stores share nothing.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a store with the default configuration and no middleware.
    pub fn new() -> Self {
        Self::from_parts(StoreConfig::default(), Pipeline::default())
    }

    /// Create a store with a custom configuration.
    pub fn with_config(config: StoreConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    /// Start building a store with middleware.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    fn from_parts(config: StoreConfig, pipeline: Pipeline) -> Self {
        let state = State {
            stack: AccessStack::default(),
            cache: ComputationCache::new(config.capacity),
            registry: HashMap::new(),
            listeners: Listeners::default(),
            pending: IndexSet::new(),
            batch_depth: 0,
            calls: 0,
            call_floor: 0,
            last_sweep: Instant::now(),
        };
        Self {
            inner: Arc::new(StoreInner {
                config,
                pipeline,
                state: ReentrantMutex::new(RefCell::new(state)),
            }),
        }
    }

    /// The configuration this store runs with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Enter a public operation: take the store lock for its whole extent and
    /// run a reclamation sweep first if one is due. Only top-level calls
    /// sweep; calls from recipes and listeners never do.
    fn enter_call(&self) -> Call<'_> {
        let serial = self.inner.state.lock();
        let (outermost, sweep_due) = {
            let mut state = serial.borrow_mut();
            state.calls += 1;
            let idle = state.stack.is_empty();
            let outermost = idle && state.calls == state.call_floor + 1;
            let due = idle
                && state.calls == 1
                && state.last_sweep.elapsed() >= self.inner.config.sweep_interval;
            (outermost, due)
        };
        let call = Call {
            store: self,
            outermost,
            _serial: serial,
        };
        if sweep_due {
            self.reclaim_now();
        }
        call
    }

    /// Report a failure of an outermost operation to middleware.
    fn finish<R>(&self, call: &Call<'_>, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            if call.outermost {
                self.report(err);
            }
        }
        result
    }

    fn report(&self, err: &AtomError) {
        trace!(error = %err, "reporting error to middleware");
        self.inner.pipeline.on_error(err);
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Get the current value of an atom, computing and caching it if needed.
    pub fn get<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T> {
        let call = self.enter_call();
        let result = self.read_atom(atom);
        self.finish(&call, result)
    }

    /// Read an atom by identity, type-erased.
    ///
    /// Fails with [`AtomError::AtomNotFound`] if the atom was never
    /// materialised in this store.
    pub fn get_key(&self, key: AtomKey) -> Result<Value> {
        let call = self.enter_call();
        let result = self.registered(key).and_then(|atom| {
            let raw = self.read_value(&atom)?;
            Ok(self.inner.pipeline.on_read(atom.info(), raw))
        });
        self.finish(&call, result)
    }

    pub(crate) fn read_atom<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T> {
        let raw = self.read_value(&atom.erased())?;
        let value = self.inner.pipeline.on_read(atom.info(), raw);
        atom.downcast(&value)
    }

    /// The value as cached, without read middleware.
    pub(crate) fn current<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T> {
        let raw = self.read_value(&atom.erased())?;
        atom.downcast(&raw)
    }

    fn read_value(&self, atom: &Arc<dyn ErasedAtom>) -> Result<Value> {
        let key = atom.info().key();
        let _frame = Frame::enter(self, key)?;

        let cached = self.with_state(|state| {
            state
                .registry
                .entry(key)
                .or_insert_with(|| Arc::clone(atom));
            state.cache.lookup(key)
        });
        if let Some(value) = cached {
            trace!(atom = %key, "cache hit");
            return Ok(value);
        }

        let getter = Getter::new(self);
        let started = Instant::now();
        let loaded = self.load(atom);
        let hydrated = loaded.is_some();
        let computed = match loaded {
            Some(value) => Ok(value),
            None => atom.compute(&getter),
        };
        let compute_time = started.elapsed();
        let dependencies = getter.into_dependencies();

        let value = match computed {
            Ok(value) => value,
            Err(err) => {
                self.with_state(|state| state.cache.park(key, dependencies));
                return Err(err);
            }
        };
        trace!(
            atom = %atom.info(),
            dependencies = dependencies.len(),
            hydrated,
            ?compute_time,
            "computed"
        );

        let previous = self.with_state(|state| state.cache.previous(key));
        let changed = previous.map_or(true, |previous| !atom.same_value(&previous, &value));
        let evicted = self.with_state(|state| {
            let evicted = state.cache.store(
                key,
                Value::clone(&value),
                dependencies,
                compute_time,
                changed,
            );
            if hydrated {
                state.cache.hold(key);
            }
            evicted
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted cache entries");
        }
        Ok(value)
    }

    /// A value supplied by middleware in place of a source atom's recipe.
    fn load(&self, atom: &Arc<dyn ErasedAtom>) -> Option<Value> {
        let info = atom.info();
        if info.kind() != AtomKind::Source {
            return None;
        }
        let loaded = self.inner.pipeline.on_load(info)?;
        debug!(atom = %info, "loaded value from middleware");
        Some(loaded)
    }

    /// The value an atom starts from when nothing is cached.
    fn initial(&self, atom: &Arc<dyn ErasedAtom>) -> Result<Value> {
        match self.load(atom) {
            Some(value) => Ok(value),
            None => atom.compute(&Getter::new(self)),
        }
    }

    fn registered(&self, key: AtomKey) -> Result<Arc<dyn ErasedAtom>> {
        self.with_state(|state| state.registry.get(&key).cloned())
            .ok_or(AtomError::AtomNotFound(key))
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Write a new value to an atom.
    ///
    /// Subscribers of the atom and of every atom whose value changes as a
    /// consequence are notified once the write completes. Writing a value
    /// equal to the current one notifies nobody.
    pub fn set<T: AtomValue>(&self, atom: &Atom<T>, value: T) -> Result<()> {
        let call = self.enter_call();
        let result = self.batch(|| self.write_atom(atom, |_| Ok(value)));
        self.finish(&call, result)
    }

    /// Write the result of applying `f` to the atom's current value.
    pub fn update<T, F>(&self, atom: &Atom<T>, f: F) -> Result<()>
    where
        T: AtomValue,
        F: FnOnce(&T) -> T,
    {
        let call = self.enter_call();
        let result = self.batch(|| {
            self.write_atom(atom, |store| store.current(atom).map(|prev| f(&prev)))
        });
        self.finish(&call, result)
    }

    pub(crate) fn write_atom<T, R>(&self, atom: &Atom<T>, resolve: R) -> Result<()>
    where
        T: AtomValue,
        R: FnOnce(&Store) -> Result<T>,
    {
        let key = atom.key();
        if !atom.is_writable() {
            warn!(atom = %atom.info(), "rejected write to read-only atom");
            return Err(AtomError::rejected(key, "atom is read-only"));
        }

        let value = resolve(self).map_err(|err| err.into_update_error(key))?;
        self.with_state(|state| {
            state.registry.entry(key).or_insert_with(|| atom.erased());
        });

        let apply = |value: Value| -> Result<()> {
            let value = atom.downcast(&value)?;
            self.commit(atom, value)
        };
        self.inner
            .pipeline
            .run_write(self, atom.info(), Arc::new(value) as Value, &apply)
            .map_err(|err| err.into_update_error(key))
    }

    fn commit<T: AtomValue>(&self, atom: &Atom<T>, value: T) -> Result<()> {
        match atom.write_recipe() {
            Some(write) => {
                let getter = Getter::new(self);
                let setter = Setter::new(self, atom.key());
                write(&getter, &setter, value)
            }
            None => {
                self.assign(&atom.erased(), Arc::new(value));
                Ok(())
            }
        }
    }

    /// Assignment of an atom from inside its own write recipe.
    pub(crate) fn assign_own<T: AtomValue>(&self, atom: &Atom<T>, value: T) -> Result<()> {
        if !atom.is_source() {
            return Err(AtomError::rejected(
                atom.key(),
                "a derived atom cannot assign its own value",
            ));
        }
        self.assign(&atom.erased(), Arc::new(value));
        Ok(())
    }

    /// Replace a source atom's value and cascade to its dependents.
    fn assign(&self, atom: &Arc<dyn ErasedAtom>, value: Value) {
        let key = atom.info().key();
        let previous = self.with_state(|state| state.cache.peek(key).map(|e| Value::clone(e.value())));
        let previous = match previous {
            Some(previous) => Some(previous),
            None => self.initial(atom).ok(),
        };

        if previous
            .as_ref()
            .is_some_and(|previous| atom.same_value(previous, &value))
        {
            debug!(atom = %atom.info(), "write suppressed: value unchanged");
            return;
        }

        let invalidated = self.with_state(|state| {
            state
                .registry
                .entry(key)
                .or_insert_with(|| Arc::clone(atom));
            state
                .cache
                .store(key, value, IndexSet::new(), Duration::ZERO, true);
            state.cache.hold(key);
            state.pending.insert(key);
            state.cache.invalidate(key, false)
        });
        self.refresh(invalidated);
    }

    /// Recompute subscribed atoms removed by a cascade and queue the ones
    /// whose value changed.
    fn refresh(&self, invalidated: Vec<Invalidated>) {
        if invalidated.is_empty() {
            return;
        }
        debug!(count = invalidated.len(), "invalidation cascade");

        for stale in graph::schedule(invalidated) {
            let atom = self.with_state(|state| {
                if state.listeners.contains(stale.key) {
                    state.registry.get(&stale.key).cloned()
                } else {
                    None
                }
            });
            let Some(atom) = atom else {
                continue;
            };

            match self.read_value(&atom) {
                Ok(fresh)
                    if stale
                        .value
                        .as_ref()
                        .is_some_and(|stale| atom.same_value(stale, &fresh)) =>
                {
                    continue
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(atom = %atom.info(), error = %err, "recomputing subscribed atom failed");
                    self.report(&err);
                }
            }
            self.with_state(|state| {
                state.pending.insert(stale.key);
            });
        }
    }

    /// Drop an atom's cached value and everything derived from it.
    ///
    /// Source atoms keep their value; only their dependents are dropped.
    /// Subscribed atoms are recomputed right away and notified if their value
    /// changed.
    pub fn invalidate<T: AtomValue>(&self, atom: &Atom<T>) {
        let _call = self.enter_call();
        let key = atom.key();
        let include_root = !atom.is_source();
        self.batch(|| {
            let invalidated = self.with_state(|state| state.cache.invalidate(key, include_root));
            self.refresh(invalidated);
        });
    }

    // ------------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------------

    /// Run `f` with notifications deferred until the outermost batch ends.
    ///
    /// Cache updates happen immediately; only listener calls are queued. Each
    /// atom that changed is notified once, in first-change order. If `f`
    /// panics, queued notifications are discarded; writes already applied
    /// are not rolled back.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _serial = self.inner.state.lock();
        self.with_state(|state| state.batch_depth += 1);
        let guard = BatchGuard { store: self };
        let out = f();
        drop(guard);
        out
    }

    fn flush(&self) {
        loop {
            let due: Vec<(AtomKey, Vec<Listener>)> = self.with_state(|state| {
                std::mem::take(&mut state.pending)
                    .into_iter()
                    .map(|key| (key, state.listeners.snapshot(key)))
                    .filter(|(_, listeners)| !listeners.is_empty())
                    .collect()
            });
            if due.is_empty() {
                return;
            }

            for (key, listeners) in due {
                trace!(atom = %key, listeners = listeners.len(), "notifying");
                for listener in listeners {
                    let _scope = ListenerScope::enter(self);
                    listener();
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Register `listener` to be called whenever the atom's value changes.
    ///
    /// The atom is computed first if it is not cached. The returned handle
    /// unsubscribes when dropped.
    pub fn subscribe<T, F>(&self, atom: &Atom<T>, listener: F) -> Result<Subscription>
    where
        T: AtomValue,
        F: Fn() + Send + Sync + 'static,
    {
        let call = self.enter_call();
        let result = self.mount(&atom.erased(), Arc::new(listener));
        self.finish(&call, result)
    }

    /// Subscribe by identity, for binding layers that only hold keys.
    pub fn subscribe_key<F>(&self, key: AtomKey, listener: F) -> Result<Subscription>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let call = self.enter_call();
        let result = self
            .registered(key)
            .and_then(|atom| self.mount(&atom, Arc::new(listener)));
        self.finish(&call, result)
    }

    fn mount(&self, atom: &Arc<dyn ErasedAtom>, listener: Listener) -> Result<Subscription> {
        self.read_value(atom)?;

        let info = atom.info();
        let listener = self.inner.pipeline.on_subscribe(info, listener);
        let key = info.key();
        let id = ListenerId::new();
        let subscribers = self.with_state(|state| {
            state.listeners.add(key, id, listener);
            state.cache.pin(key);
            state.listeners.count(key)
        });
        debug!(atom = %info, subscribers, "subscribed");

        Ok(Subscription::new(self.clone(), key, id))
    }

    pub(crate) fn unsubscribe(&self, key: AtomKey, id: ListenerId) {
        let max_age = self.inner.config.max_age;
        let dropped = self.with_state(|state| {
            if !state.listeners.remove(key, id) {
                return false;
            }
            state.cache.unpin(key);

            let idle = !state.listeners.contains(key)
                && state.cache.is_evictable(key)
                && state.cache.is_stale(key, Instant::now(), max_age);
            if idle {
                state.cache.remove(key);
            }
            idle
        });
        trace!(atom = %key, dropped, "unsubscribed");
    }

    /// Number of listeners registered for the atom.
    pub fn subscriber_count<T: AtomValue>(&self, atom: &Atom<T>) -> usize {
        self.with_state(|state| state.listeners.count(atom.key()))
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// The atoms read by the atom's last computation.
    ///
    /// Fails with [`AtomError::AtomNotFound`] if the atom is not cached.
    pub fn dependencies<T: AtomValue>(&self, atom: &Atom<T>) -> Result<Vec<AtomKey>> {
        let key = atom.key();
        self.with_state(|state| {
            state
                .cache
                .peek(key)
                .map(|entry| entry.dependencies().iter().copied().collect())
        })
        .ok_or(AtomError::AtomNotFound(key))
    }

    /// Cached atoms whose last computation read this atom.
    pub fn dependents<T: AtomValue>(&self, atom: &Atom<T>) -> Vec<AtomKey> {
        self.with_state(|state| state.cache.dependents_of(atom.key()))
    }

    /// Version of the cached value, if cached.
    pub fn version<T: AtomValue>(&self, atom: &Atom<T>) -> Option<u64> {
        self.with_state(|state| state.cache.peek(atom.key()).map(CacheEntry::version))
    }

    /// A copy of the atom's cache entry, if cached.
    pub fn entry_info<T: AtomValue>(&self, atom: &Atom<T>) -> Option<CacheEntry> {
        self.with_state(|state| state.cache.peek(atom.key()).cloned())
    }

    /// Whether the atom currently has a cached value.
    pub fn is_cached<T: AtomValue>(&self, atom: &Atom<T>) -> bool {
        self.with_state(|state| state.cache.contains(atom.key()))
    }

    /// Number of live cache entries.
    pub fn cached_len(&self) -> usize {
        self.with_state(|state| state.cache.len())
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Reclaim entries idle past `max_age` now. Returns how many were dropped.
    pub fn reclaim(&self) -> usize {
        let _call = self.enter_call();
        self.reclaim_now()
    }

    fn reclaim_now(&self) -> usize {
        let max_age = self.inner.config.max_age;
        let reclaimed = self.with_state(|state| {
            let now = Instant::now();
            state.last_sweep = now;
            state.cache.sweep(now, max_age)
        });
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed idle cache entries");
        }
        reclaimed.len()
    }

    /// Capture every cached value.
    pub fn snapshot(&self) -> Snapshot {
        self.with_state(|state| Snapshot {
            values: state
                .cache
                .iter()
                .map(|(key, entry)| (key, Value::clone(entry.value())))
                .collect(),
        })
    }

    /// Bring source atoms back to the values in `snapshot`.
    ///
    /// Sources in the snapshot are assigned its value, cached sources missing
    /// from it return to their initial value, and derived atoms recompute on
    /// demand. Middleware does not see these writes. Every atom in the
    /// snapshot must be known to this store, otherwise nothing is applied.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let call = self.enter_call();
        let result = self.restore_sources(snapshot);
        self.finish(&call, result)
    }

    fn restore_sources(&self, snapshot: &Snapshot) -> Result<()> {
        let mut targets = Vec::with_capacity(snapshot.len());
        for (key, value) in &snapshot.values {
            let atom = self.registered(*key)?;
            if atom.info().kind() == AtomKind::Source {
                targets.push((atom, Value::clone(value)));
            }
        }

        let resets: Vec<Arc<dyn ErasedAtom>> = self.with_state(|state| {
            state
                .cache
                .iter()
                .filter(|(key, _)| !snapshot.values.contains_key(key))
                .filter_map(|(key, _)| state.registry.get(&key).cloned())
                .filter(|atom| atom.info().kind() == AtomKind::Source)
                .collect()
        });

        self.batch(|| {
            for atom in resets {
                match self.initial(&atom) {
                    Ok(initial) => self.assign(&atom, initial),
                    Err(err) => self.report(&err),
                }
            }
            for (atom, value) in targets {
                self.assign(&atom, value);
            }
        });
        debug!(atoms = snapshot.len(), "snapshot restored");
        Ok(())
    }

    /// Drop every cached value. Subscriptions stay registered; subscribed
    /// atoms are recomputed and notified if their value changed.
    pub fn clear(&self) {
        let _call = self.enter_call();
        self.batch(|| {
            let invalidated = self.with_state(|state| state.cache.clear());
            debug!(count = invalidated.len(), "cache cleared");
            self.refresh(invalidated);
        });
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cached, subscribed) =
            self.with_state(|state| (state.cache.len(), state.listeners.keys().count()));
        f.debug_struct("Store")
            .field("cached", &cached)
            .field("subscribed_atoms", &subscribed)
            .field("middleware", &self.inner.pipeline.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Guard for one public operation.
struct Call<'a> {
    store: &'a Store,
    outermost: bool,
    _serial: ReentrantMutexGuard<'a, RefCell<State>>,
}

impl Drop for Call<'_> {
    fn drop(&mut self) {
        self.store.with_state(|state| state.calls -= 1);
    }
}

/// Marks the current call depth as the floor for calls a listener makes.
struct ListenerScope<'a> {
    store: &'a Store,
    floor: usize,
}

impl<'a> ListenerScope<'a> {
    fn enter(store: &'a Store) -> Self {
        let floor = store.with_state(|state| {
            let calls = state.calls;
            std::mem::replace(&mut state.call_floor, calls)
        });
        Self { store, floor }
    }
}

impl Drop for ListenerScope<'_> {
    fn drop(&mut self) {
        let floor = self.floor;
        self.store.with_state(|state| state.call_floor = floor);
    }
}

/// Closes one batch level; the outermost close delivers notifications.
struct BatchGuard<'a> {
    store: &'a Store,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let outermost = self.store.with_state(|state| {
            state.batch_depth -= 1;
            state.batch_depth == 0
        });
        if !outermost {
            return;
        }

        if std::thread::panicking() {
            let dropped = self
                .store
                .with_state(|state| std::mem::take(&mut state.pending).len());
            if dropped > 0 {
                warn!(dropped, "batch unwound, pending notifications discarded");
            }
            return;
        }
        self.store.flush();
    }
}

/// Builder for a [`Store`] with middleware.
#[derive(Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl StoreBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Append an interceptor. Interceptors run in the order they are added.
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Validate the configuration and build the store.
    pub fn build(self) -> Result<Store, ConfigError> {
        self.config.validate()?;
        Ok(Store::from_parts(self.config, Pipeline::new(self.middleware)))
    }
}

/// Cached values captured by [`Store::snapshot`].
#[derive(Clone, Default)]
pub struct Snapshot {
    values: IndexMap<AtomKey, Value>,
}

impl Snapshot {
    /// The captured value of `atom`, if it was cached.
    pub fn get<T: AtomValue>(&self, atom: &Atom<T>) -> Option<T> {
        self.values
            .get(&atom.key())
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// Whether the snapshot holds a value for `key`.
    pub fn contains(&self, key: AtomKey) -> bool {
        self.values.contains_key(&key)
    }

    /// Captured atoms, in cache order.
    pub fn keys(&self) -> impl Iterator<Item = AtomKey> + '_ {
        self.values.keys().copied()
    }

    /// Number of captured atoms.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was cached at capture time.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counter() -> (Arc<AtomicI32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicI32::new(0));
        let clone = count.clone();
        (count, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Store>();
        assert_send_sync::<Subscription>();
    }

    #[test]
    fn state_is_balanced_after_operations() {
        let store = Store::new();
        let a = Atom::new(1);
        let b = Atom::derived({
            let a = a.clone();
            move |get| Ok(get.get(&a)? + 1)
        });

        store.get(&b).unwrap();
        store.set(&a, 2).unwrap();
        store.batch(|| store.set(&a, 3)).unwrap();

        store.with_state(|state| {
            assert!(state.stack.is_empty());
            assert_eq!(state.batch_depth, 0);
            assert_eq!(state.calls, 0);
            assert!(state.pending.is_empty());
        });
    }

    #[test]
    fn nested_batches_flush_once_at_the_outermost() {
        let store = Store::new();
        let a = Atom::new(0);
        let (count, listener) = counter();
        let _sub = store.subscribe(&a, listener).unwrap();

        store.batch(|| {
            store.set(&a, 1).unwrap();
            store.batch(|| store.set(&a, 2).unwrap());
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_may_write_back_into_the_store() {
        let store = Store::new();
        let a = Atom::new(0);
        let mirror = Atom::new(0);

        let _sub = store
            .subscribe(&a, {
                let store = store.clone();
                let a = a.clone();
                let mirror = mirror.clone();
                move || {
                    let value = store.get(&a).unwrap();
                    store.set(&mirror, value * 10).unwrap();
                }
            })
            .unwrap();

        store.set(&a, 4).unwrap();
        assert_eq!(store.get(&mirror).unwrap(), 40);
    }

    #[test]
    fn writes_from_other_threads_are_serialised() {
        let store = Store::new();
        let counter_atom = Atom::new(0u32);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let atom = counter_atom.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store.update(&atom, |n| n + 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get(&counter_atom).unwrap(), 1000);
    }

    #[test]
    fn separate_stores_are_independent() {
        let a = Atom::new(1);
        let first = Store::new();
        let second = Store::new();

        first.set(&a, 5).unwrap();
        assert_eq!(first.get(&a).unwrap(), 5);
        assert_eq!(second.get(&a).unwrap(), 1);
    }

    #[test]
    fn panicking_batch_discards_notifications() {
        let store = Store::new();
        let a = Atom::new(0);
        let (count, listener) = counter();
        let _sub = store.subscribe(&a, listener).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.batch(|| {
                store.set(&a, 1).unwrap();
                panic!("boom");
            })
        }));

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // The write itself is kept.
        assert_eq!(store.get(&a).unwrap(), 1);
        store.with_state(|state| assert_eq!(state.batch_depth, 0));
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let err = Store::builder()
            .config(StoreConfig::default().with_max_depth(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "max_depth" }));
    }
}
