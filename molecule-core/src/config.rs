//! Store Configuration
//!
//! Tuning knobs for the computation cache and the dependency tracker. A
//! configuration can be built in code or loaded from a JSON document; missing
//! fields fall back to the defaults below.
//!
//! ```json
//! { "capacity": 5000, "max_age": 120.0, "sweep_interval": 30.0, "max_depth": 64 }
//! ```
//!
//! Durations are expressed in (fractional) seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of live cache entries before LRU eviction kicks in.
    pub capacity: usize,

    /// Entries not accessed for this long are reclaimed by the sweep.
    #[serde(with = "seconds")]
    pub max_age: Duration,

    /// Minimum time between two reclamation sweeps.
    #[serde(with = "seconds")]
    pub sweep_interval: Duration,

    /// Maximum nesting of `get` calls inside read recipes.
    pub max_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_age: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            max_depth: 100,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from JSON, applying defaults to missing fields.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the store cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Zero { field: "capacity" });
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Zero { field: "max_depth" });
        }
        Ok(())
    }

    /// Set the cache capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the idle age after which entries are reclaimed.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the interval between reclamation sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the maximum `get` nesting depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
