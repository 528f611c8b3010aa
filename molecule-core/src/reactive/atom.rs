//! Atom Descriptor
//!
//! An atom is an identity plus a recipe for producing a value. It never holds
//! the value itself: values live in the store's computation cache, keyed by
//! the atom's [`AtomKey`].
//!
//! # Kinds of Atoms
//!
//! - **Source** atoms are seeded with an initial value and are assigned
//!   directly by `set`.
//! - **Derived** atoms compute their value from other atoms through a read
//!   recipe. Without a write recipe they are read-only.
//! - **Writable** derived atoms additionally translate an update into `set`
//!   calls on other atoms.
//!
//! # Identity
//!
//! Keys come from a process-wide counter, so two atoms are never equal even if
//! their recipes are identical. Cloning an `Atom` clones the handle, not the
//! identity.

use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::context::{Getter, Setter};
use crate::error::{AtomError, Result};

/// A type-erased atom value as stored in the cache.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Bound shared by every value an atom can hold.
///
/// `PartialEq` is needed for change suppression: a write or recomputation that
/// produces an equal value does not notify subscribers.
pub trait AtomValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> AtomValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Counter for generating unique atom keys.
static ATOM_KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque, globally unique identity of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AtomKey(u64);

impl AtomKey {
    fn next() -> Self {
        Self(ATOM_KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw key value.
    pub fn raw(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for AtomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom#{}", self.0)
    }
}

/// The recipe shape of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    /// Seeded with a value, assigned directly.
    Source,
    /// Computed from other atoms, read-only.
    Derived,
    /// Computed from other atoms, with a write recipe.
    Writable,
}

/// Identity and metadata of an atom, independent of its value type.
///
/// This is what middleware and other type-agnostic collaborators see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomInfo {
    key: AtomKey,
    label: Option<Arc<str>>,
    kind: AtomKind,
    writable: bool,
}

impl AtomInfo {
    /// The atom's identity.
    pub fn key(&self) -> AtomKey {
        self.key
    }

    /// The debug label, if one was given.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The recipe shape.
    pub fn kind(&self) -> AtomKind {
        self.kind
    }

    /// Whether `set` is accepted for this atom.
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl fmt::Display for AtomInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{label} ({})", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

pub(crate) type ReadFn<T> = dyn Fn(&Getter<'_>) -> Result<T> + Send + Sync;
pub(crate) type WriteFn<T> = dyn Fn(&Getter<'_>, &Setter<'_>, T) -> Result<()> + Send + Sync;

enum Recipe<T> {
    Source(T),
    Derived(Arc<ReadFn<T>>),
}

impl<T: Clone> Clone for Recipe<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Source(initial) => Self::Source(initial.clone()),
            Self::Derived(read) => Self::Derived(Arc::clone(read)),
        }
    }
}

pub(crate) struct AtomDef<T> {
    info: AtomInfo,
    recipe: Recipe<T>,
    write: Option<Arc<WriteFn<T>>>,
}

/// A handle to an atom holding values of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let base = Atom::new(0).with_label("base");
/// let doubled = Atom::derived({
///     let base = base.clone();
///     move |get| Ok(get.get(&base)? * 2)
/// });
///
/// let store = Store::new();
/// store.set(&base, 5)?;
/// assert_eq!(store.get(&doubled)?, 10);
/// ```
pub struct Atom<T: AtomValue> {
    def: Arc<AtomDef<T>>,
}

impl<T: AtomValue> Atom<T> {
    /// Create a source atom seeded with `initial`.
    pub fn new(initial: T) -> Self {
        Self::from_parts(AtomKind::Source, Recipe::Source(initial), None)
    }

    /// Create a read-only derived atom.
    pub fn derived<R>(read: R) -> Self
    where
        R: Fn(&Getter<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::from_parts(AtomKind::Derived, Recipe::Derived(Arc::new(read)), None)
    }

    /// Create a derived atom that also accepts updates.
    ///
    /// The write recipe receives the resolved update and forwards it to other
    /// atoms through the [`Setter`].
    pub fn writable<R, W>(read: R, write: W) -> Self
    where
        R: Fn(&Getter<'_>) -> Result<T> + Send + Sync + 'static,
        W: Fn(&Getter<'_>, &Setter<'_>, T) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_parts(
            AtomKind::Writable,
            Recipe::Derived(Arc::new(read)),
            Some(Arc::new(write)),
        )
    }

    fn from_parts(kind: AtomKind, recipe: Recipe<T>, write: Option<Arc<WriteFn<T>>>) -> Self {
        let writable = kind == AtomKind::Source || write.is_some();
        Self {
            def: Arc::new(AtomDef {
                info: AtomInfo {
                    key: AtomKey::next(),
                    label: None,
                    kind,
                    writable,
                },
                recipe,
                write,
            }),
        }
    }

    /// Attach a debug label. The identity is unchanged.
    pub fn with_label(self, label: impl Into<Arc<str>>) -> Self {
        let mut info = self.def.info.clone();
        info.label = Some(label.into());
        self.rebuild(info, self.def.write.clone())
    }

    /// Route updates of a source atom through a write recipe.
    ///
    /// Inside the recipe, setting the atom itself assigns its value directly.
    pub fn with_write<W>(self, write: W) -> Self
    where
        W: Fn(&Getter<'_>, &Setter<'_>, T) -> Result<()> + Send + Sync + 'static,
    {
        let mut info = self.def.info.clone();
        info.writable = true;
        if info.kind == AtomKind::Derived {
            info.kind = AtomKind::Writable;
        }
        self.rebuild(info, Some(Arc::new(write)))
    }

    fn rebuild(&self, info: AtomInfo, write: Option<Arc<WriteFn<T>>>) -> Self {
        Self {
            def: Arc::new(AtomDef {
                info,
                recipe: self.def.recipe.clone(),
                write,
            }),
        }
    }

    /// The atom's identity.
    pub fn key(&self) -> AtomKey {
        self.def.info.key
    }

    /// The debug label, if any.
    pub fn label(&self) -> Option<&str> {
        self.def.info.label()
    }

    /// Identity and metadata without the value type.
    pub fn info(&self) -> &AtomInfo {
        &self.def.info
    }

    /// Whether this is a source atom.
    pub fn is_source(&self) -> bool {
        self.def.info.kind == AtomKind::Source
    }

    /// Whether `set` is accepted.
    pub fn is_writable(&self) -> bool {
        self.def.info.writable
    }

    pub(crate) fn erased(&self) -> Arc<dyn ErasedAtom> {
        Arc::clone(&self.def) as Arc<dyn ErasedAtom>
    }

    pub(crate) fn write_recipe(&self) -> Option<&Arc<WriteFn<T>>> {
        self.def.write.as_ref()
    }

    /// Recover a typed value from the cache representation.
    pub(crate) fn downcast(&self, value: &Value) -> Result<T> {
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or(AtomError::TypeMismatch { atom: self.key() })
    }
}

impl<T: AtomValue> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            def: Arc::clone(&self.def),
        }
    }
}

impl<T: AtomValue> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T: AtomValue> Eq for Atom<T> {}

impl<T: AtomValue> Hash for Atom<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl<T: AtomValue> Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("key", &self.key())
            .field("label", &self.label())
            .field("kind", &self.def.info.kind)
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Type-erased view of an atom used by the store for recomputation and
/// change comparison when only the key is known.
pub(crate) trait ErasedAtom: Send + Sync {
    fn info(&self) -> &AtomInfo;

    /// Run the read recipe (or produce the seed of a source atom).
    fn compute(&self, getter: &Getter<'_>) -> Result<Value>;

    /// Compare two values of this atom with `T`'s equality.
    fn same_value(&self, a: &Value, b: &Value) -> bool;
}

impl<T: AtomValue> ErasedAtom for AtomDef<T> {
    fn info(&self) -> &AtomInfo {
        &self.info
    }

    fn compute(&self, getter: &Getter<'_>) -> Result<Value> {
        match &self.recipe {
            Recipe::Source(initial) => Ok(Arc::new(initial.clone())),
            Recipe::Derived(read) => read(getter).map(|value| Arc::new(value) as Value),
        }
    }

    fn same_value(&self, a: &Value, b: &Value) -> bool {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => Arc::ptr_eq(a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_keys_are_unique() {
        let a = Atom::new(0);
        let b = Atom::new(0);
        let c = Atom::derived(|_| Ok(0));

        assert_ne!(a.key(), b.key());
        assert_ne!(b.key(), c.key());
        assert_ne!(a, b);
    }

    #[test]
    fn clone_keeps_identity() {
        let a = Atom::new("x".to_string());
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn label_does_not_change_identity() {
        let a = Atom::new(1);
        let key = a.key();
        let labeled = a.with_label("count");

        assert_eq!(labeled.key(), key);
        assert_eq!(labeled.label(), Some("count"));
        assert_eq!(labeled.info().to_string(), format!("count ({key})"));
    }

    #[test]
    fn kinds_and_writability() {
        let source = Atom::new(1);
        let derived = Atom::derived(|_| Ok(1));
        let writable = Atom::writable(|_| Ok(1), |_, _, _| Ok(()));

        assert!(source.is_source() && source.is_writable());
        assert_eq!(derived.info().kind(), AtomKind::Derived);
        assert!(!derived.is_writable());
        assert_eq!(writable.info().kind(), AtomKind::Writable);
        assert!(writable.is_writable());

        let upgraded = derived.with_write(|_, _, _: i32| Ok(()));
        assert_eq!(upgraded.info().kind(), AtomKind::Writable);
    }

    #[test]
    fn erased_comparison_uses_value_equality() {
        let atom = Atom::new(vec![1, 2]);
        let erased = atom.erased();
        let a: Value = Arc::new(vec![1, 2]);
        let b: Value = Arc::new(vec![1, 2]);
        let c: Value = Arc::new(vec![3]);

        assert!(erased.same_value(&a, &b));
        assert!(!erased.same_value(&a, &c));
    }

    #[test]
    fn downcast_rejects_foreign_values() {
        let atom = Atom::new(1u8);
        let foreign: Value = Arc::new("nope");
        assert!(matches!(
            atom.downcast(&foreign),
            Err(AtomError::TypeMismatch { .. })
        ));
    }
}
