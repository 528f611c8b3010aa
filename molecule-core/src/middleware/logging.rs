//! Logging interceptor.
//!
//! Emits a `tracing` event for every store operation it sees. Reads are
//! logged at `TRACE`, writes and subscriptions at `DEBUG`, errors at `WARN`.
//! The interceptor never changes a value; installing a subscriber is left to
//! the application.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::{Middleware, Next};
use crate::error::{AtomError, Result};
use crate::reactive::{AtomInfo, Listener, Value};

/// A middleware that logs store operations through `tracing`.
#[derive(Debug, Clone)]
pub struct Logging {
    reads: bool,
    writes: bool,
    subscriptions: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self::new()
    }
}

impl Logging {
    /// Log everything.
    pub fn new() -> Self {
        Self {
            reads: true,
            writes: true,
            subscriptions: true,
        }
    }

    /// Toggle read events. Reads are frequent, so this is the usual one to
    /// switch off.
    pub fn reads(mut self, enabled: bool) -> Self {
        self.reads = enabled;
        self
    }

    /// Toggle write events.
    pub fn writes(mut self, enabled: bool) -> Self {
        self.writes = enabled;
        self
    }

    /// Toggle subscription and notification events.
    pub fn subscriptions(mut self, enabled: bool) -> Self {
        self.subscriptions = enabled;
        self
    }
}

impl Middleware for Logging {
    fn on_read(&self, atom: &AtomInfo, value: Value) -> Value {
        if self.reads {
            trace!(atom = %atom, "read");
        }
        value
    }

    fn on_write(&self, atom: &AtomInfo, value: Value, next: Next<'_>) -> Result<()> {
        if !self.writes {
            return next.run(value);
        }

        let started = Instant::now();
        let result = next.run(value);
        match &result {
            Ok(()) => debug!(atom = %atom, elapsed = ?started.elapsed(), "write"),
            Err(err) => debug!(atom = %atom, error = %err, "write failed"),
        }
        result
    }

    fn on_subscribe(&self, atom: &AtomInfo, listener: Listener) -> Listener {
        if !self.subscriptions {
            return listener;
        }

        debug!(atom = %atom, "subscribe");
        let atom = atom.clone();
        Arc::new(move || {
            trace!(atom = %atom, "notify");
            listener();
        })
    }

    fn on_error(&self, error: &AtomError) {
        warn!(error = %error, "store operation failed");
    }
}
