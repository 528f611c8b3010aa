//! Middleware Pipeline
//!
//! Interceptors observe and transform reads, writes, and subscriptions
//! without the store knowing what they do. Logging, persistence, and the
//! debugging history in this crate are all plain middleware.
//!
//! # Ordering
//!
//! - `on_read` and `on_subscribe` run in registration order, each receiving
//!   the previous one's output.
//! - `on_write` is onion-style: each interceptor gets a [`Next`] continuation
//!   and decides whether and when to call it. An interceptor that never calls
//!   `next` suppresses the write for everything after it, the store included.
//!   Returning an error aborts the write; the caller sees it wrapped as
//!   [`AtomError::InvalidAtomUpdate`].
//! - `on_load` may supply a stored value for a source atom the store has no
//!   entry for. The first interceptor that returns one wins, and the value is
//!   cached as if it had been written.
//! - `on_error` is a best-effort observation hook and cannot fail.
//!
//! `on_read` transforms are not cached: the cache always holds the value the
//! recipe computed.

mod history;
mod logging;
mod persist;

use std::sync::Arc;

pub use history::{History, HistoryRecord, HistorySnapshot};
pub use logging::Logging;
pub use persist::{
    Codec, FileStorage, JsonCodec, MemoryStorage, MessagePackCodec, Persist, Storage,
    StorageError,
};

use crate::error::{AtomError, Result};
use crate::reactive::{AtomInfo, Listener, Store, Value};

/// An interceptor around store operations. Every hook has a pass-through
/// default, so implementors override only what they need.
pub trait Middleware: Send + Sync {
    /// Transform a value on its way out of `get`.
    fn on_read(&self, atom: &AtomInfo, value: Value) -> Value {
        let _ = atom;
        value
    }

    /// Intercept a write. Call `next.run(value)` to let it proceed.
    fn on_write(&self, atom: &AtomInfo, value: Value, next: Next<'_>) -> Result<()> {
        let _ = atom;
        next.run(value)
    }

    /// Supply a value for a source atom in place of its initial value.
    ///
    /// Asked whenever the store is about to materialise the atom from its
    /// recipe. The returned value must have the atom's type.
    fn on_load(&self, atom: &AtomInfo) -> Option<Value> {
        let _ = atom;
        None
    }

    /// Wrap a listener before it is registered.
    fn on_subscribe(&self, atom: &AtomInfo, listener: Listener) -> Listener {
        let _ = atom;
        listener
    }

    /// Observe an error raised by a store operation.
    fn on_error(&self, error: &AtomError) {
        let _ = error;
    }
}

impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    fn on_read(&self, atom: &AtomInfo, value: Value) -> Value {
        (**self).on_read(atom, value)
    }

    fn on_write(&self, atom: &AtomInfo, value: Value, next: Next<'_>) -> Result<()> {
        (**self).on_write(atom, value, next)
    }

    fn on_load(&self, atom: &AtomInfo) -> Option<Value> {
        (**self).on_load(atom)
    }

    fn on_subscribe(&self, atom: &AtomInfo, listener: Listener) -> Listener {
        (**self).on_subscribe(atom, listener)
    }

    fn on_error(&self, error: &AtomError) {
        (**self).on_error(error)
    }
}

/// Continuation passed to [`Middleware::on_write`].
///
/// Running it hands the value to the next interceptor, or to the store once
/// every interceptor has had its turn.
pub struct Next<'a> {
    store: &'a Store,
    atom: &'a AtomInfo,
    rest: &'a [Arc<dyn Middleware>],
    apply: &'a dyn Fn(Value) -> Result<()>,
}

impl<'a> Next<'a> {
    /// Continue the write with `value`.
    pub fn run(self, value: Value) -> Result<()> {
        match self.rest.split_first() {
            Some((head, rest)) => head.on_write(self.atom, value, Next { rest, ..self }),
            None => (self.apply)(value),
        }
    }

    /// The store the write is happening in.
    pub fn store(&self) -> &'a Store {
        self.store
    }
}

/// The ordered interceptor list owned by a store.
#[derive(Clone, Default)]
pub(crate) struct Pipeline {
    interceptors: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub(crate) fn new(interceptors: Vec<Arc<dyn Middleware>>) -> Self {
        Self { interceptors }
    }

    pub(crate) fn on_read(&self, atom: &AtomInfo, value: Value) -> Value {
        self.interceptors
            .iter()
            .fold(value, |value, m| m.on_read(atom, value))
    }

    pub(crate) fn on_load(&self, atom: &AtomInfo) -> Option<Value> {
        self.interceptors.iter().find_map(|m| m.on_load(atom))
    }

    pub(crate) fn on_subscribe(&self, atom: &AtomInfo, listener: Listener) -> Listener {
        self.interceptors
            .iter()
            .fold(listener, |listener, m| m.on_subscribe(atom, listener))
    }

    pub(crate) fn on_error(&self, error: &AtomError) {
        for m in &self.interceptors {
            m.on_error(error);
        }
    }

    pub(crate) fn run_write(
        &self,
        store: &Store,
        atom: &AtomInfo,
        value: Value,
        apply: &dyn Fn(Value) -> Result<()>,
    ) -> Result<()> {
        Next {
            store,
            atom,
            rest: &self.interceptors,
            apply,
        }
        .run(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.interceptors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Atom;
    use parking_lot::Mutex;

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        forward: bool,
    }

    impl Middleware for Tag {
        fn on_read(&self, _atom: &AtomInfo, value: Value) -> Value {
            let n = value.downcast_ref::<i32>().copied().unwrap_or_default();
            Arc::new(n * 10 + 1)
        }

        fn on_write(&self, _atom: &AtomInfo, value: Value, next: Next<'_>) -> Result<()> {
            self.log.lock().push(format!("{}:before", self.name));
            if !self.forward {
                return Ok(());
            }
            let result = next.run(value);
            self.log.lock().push(format!("{}:after", self.name));
            result
        }
    }

    fn pipeline(log: &Arc<Mutex<Vec<String>>>, forward: [bool; 2]) -> Pipeline {
        Pipeline::new(vec![
            Arc::new(Tag {
                name: "a",
                log: log.clone(),
                forward: forward[0],
            }) as Arc<dyn Middleware>,
            Arc::new(Tag {
                name: "b",
                log: log.clone(),
                forward: forward[1],
            }) as Arc<dyn Middleware>,
        ])
    }

    #[test]
    fn reads_chain_left_to_right() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log, [true, true]);
        let atom = Atom::new(0);

        let out = pipeline.on_read(atom.info(), Arc::new(2));
        assert_eq!(out.downcast_ref::<i32>(), Some(&211));
    }

    #[test]
    fn writes_nest_like_an_onion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log, [true, true]);
        let store = Store::new();
        let atom = Atom::new(0);
        let applied = Mutex::new(None);

        pipeline
            .run_write(&store, atom.info(), Arc::new(5), &|value: Value| {
                log.lock().push("apply".into());
                *applied.lock() = value.downcast_ref::<i32>().copied();
                Ok(())
            })
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["a:before", "b:before", "apply", "b:after", "a:after"]
        );
        assert_eq!(*applied.lock(), Some(5));
    }

    #[test]
    fn a_middleware_that_skips_next_suppresses_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline(&log, [false, true]);
        let store = Store::new();
        let atom = Atom::new(0);

        pipeline
            .run_write(&store, atom.info(), Arc::new(5), &|_: Value| {
                log.lock().push("apply".into());
                Ok(())
            })
            .unwrap();

        assert_eq!(*log.lock(), vec!["a:before"]);
    }

    #[test]
    fn empty_pipeline_passes_everything_through() {
        let pipeline = Pipeline::default();
        let atom = Atom::new(0);
        assert_eq!(pipeline.len(), 0);

        let out = pipeline.on_read(atom.info(), Arc::new(3));
        assert_eq!(out.downcast_ref::<i32>(), Some(&3));
        assert!(pipeline.on_load(atom.info()).is_none());
    }

    struct Seed(i32);

    impl Middleware for Seed {
        fn on_load(&self, _atom: &AtomInfo) -> Option<Value> {
            Some(Arc::new(self.0))
        }
    }

    #[test]
    fn first_loaded_value_wins() {
        let pipeline = Pipeline::new(vec![
            Arc::new(Seed(1)) as Arc<dyn Middleware>,
            Arc::new(Seed(2)) as Arc<dyn Middleware>,
        ]);
        let atom = Atom::new(0);

        let loaded = pipeline.on_load(atom.info()).unwrap();
        assert_eq!(loaded.downcast_ref::<i32>(), Some(&1));
    }
}
