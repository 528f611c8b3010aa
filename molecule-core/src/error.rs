//! Error types for the atom runtime.
//!
//! Every fallible operation in the crate returns [`AtomError`]. Recipes return
//! it too, so a nested `get` inside a read recipe can be propagated with `?`.

use std::fmt;

use crate::reactive::AtomKey;

/// Convenience alias used throughout the crate.
pub type Result<T, E = AtomError> = std::result::Result<T, E>;

/// Errors surfaced by the store and by atom recipes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AtomError {
    /// A `get` chain revisited an atom that is already being computed, or the
    /// chain grew past the configured maximum depth.
    #[error("circular dependency while reading {atom}: {}", Path(.path))]
    CircularDependency {
        /// The atom whose read closed the cycle.
        atom: AtomKey,
        /// The access stack at the time of the failure, ending with `atom`.
        path: Vec<AtomKey>,
    },

    /// The identity has no cache entry and no registered recipe in this store.
    #[error("atom {0} not found")]
    AtomNotFound(AtomKey),

    /// An update did not take effect: the atom is read-only, a middleware
    /// aborted the write, or the write recipe failed.
    #[error("cannot update {atom}: {reason}")]
    InvalidAtomUpdate {
        /// The atom being written.
        atom: AtomKey,
        /// Human readable cause, preserved from the original failure.
        reason: String,
        /// The underlying error, if the update failed downstream.
        #[source]
        source: Option<Box<AtomError>>,
    },

    /// A middleware substituted a value whose type does not match the atom.
    #[error("value for {atom} has an unexpected type")]
    TypeMismatch {
        /// The atom that received the value.
        atom: AtomKey,
    },

    /// A caller supplied recipe failed.
    #[error("{0}")]
    Failed(String),
}

impl AtomError {
    /// Build a recipe failure from anything displayable.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Shorthand for an update rejected before anything downstream ran.
    pub(crate) fn rejected(atom: AtomKey, reason: impl Into<String>) -> Self {
        Self::InvalidAtomUpdate {
            atom,
            reason: reason.into(),
            source: None,
        }
    }

    /// Wrap a write-path failure as [`AtomError::InvalidAtomUpdate`].
    ///
    /// Errors that already describe a failed update are returned unchanged so
    /// nested writes are not wrapped twice.
    pub(crate) fn into_update_error(self, atom: AtomKey) -> Self {
        match self {
            err @ Self::InvalidAtomUpdate { .. } => err,
            other => Self::InvalidAtomUpdate {
                atom,
                reason: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Whether this error is a cycle or depth-limit failure.
    pub fn is_circular(&self) -> bool {
        matches!(self, Self::CircularDependency { .. })
    }
}

/// Display adapter for an access path: `atom#1 -> atom#2 -> atom#1`.
struct Path<'a>(&'a [AtomKey]);

impl fmt::Display for Path<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

/// Errors raised while building a [`StoreConfig`](crate::StoreConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("invalid store configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value the store cannot run with.
    #[error("invalid store configuration: {field} must be greater than zero")]
    Zero {
        /// Name of the offending field.
        field: &'static str,
    },
}
