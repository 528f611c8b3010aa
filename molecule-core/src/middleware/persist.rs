//! Persistence interceptor.
//!
//! Mirrors one atom into a durable key-value medium. The medium is keyed by a
//! caller-chosen string, not by the atom identity, so a value survives across
//! processes even though atom keys do not.
//!
//! - When the store first materialises the atom, the stored value (if any)
//!   is loaded and cached in place of the initial value, exactly as if it had
//!   been written. Functional updates and snapshots see it like any other
//!   value.
//! - After a write goes through, the written value is encoded and saved.
//!
//! Failing to load or save is logged and otherwise ignored; the in-memory
//! operation always proceeds.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Middleware, Next};
use crate::error::Result;
use crate::reactive::{Atom, AtomInfo, AtomKey, AtomValue, Value};

/// Errors raised by a storage medium or a codec.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The medium could not be read or written.
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The value could not be serialized.
    #[error("failed to encode value: {0}")]
    Encode(String),

    /// The stored bytes could not be deserialized.
    #[error("failed to decode value: {0}")]
    Decode(String),
}

/// A durable key-value medium.
pub trait Storage: Send + Sync {
    /// Load the bytes stored under `key`, if any.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `bytes` under `key`, replacing what was there.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Forget `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).load(key)
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).save(key, bytes)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// In-process storage, mostly useful for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key inside a directory.
///
/// Keys are sanitised into file names: anything other than ASCII
/// alphanumerics, `-`, `_` and `.` becomes `_`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store files under `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(name)
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(key), bytes)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Serialization format for persisted values.
pub trait Codec: Send + Sync {
    /// Serialize `value` to bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StorageError>;

    /// Deserialize bytes produced by [`encode`](Self::encode).
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StorageError>;
}

/// JSON text, the default format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(value).map_err(|err| StorageError::Encode(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StorageError> {
        serde_json::from_slice(bytes).map_err(|err| StorageError::Decode(err.to_string()))
    }
}

/// Compact binary MessagePack, with struct fields encoded by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl Codec for MessagePackCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StorageError> {
        rmp_serde::to_vec_named(value).map_err(|err| StorageError::Encode(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StorageError> {
        rmp_serde::from_slice(bytes).map_err(|err| StorageError::Decode(err.to_string()))
    }
}

/// Middleware persisting a single atom.
///
/// # Example
///
/// ```rust,ignore
/// let theme = Atom::new("light".to_string());
/// let store = Store::builder()
///     .middleware(Persist::new(&theme, "theme", FileStorage::new("state")))
///     .build()?;
/// ```
pub struct Persist<T: AtomValue, S, C = JsonCodec> {
    atom: AtomKey,
    key: String,
    storage: S,
    codec: C,
    _value: PhantomData<fn() -> T>,
}

impl<T: AtomValue, S: Storage> Persist<T, S, JsonCodec> {
    /// Persist `atom` under `key` in `storage`, encoded as JSON.
    pub fn new(atom: &Atom<T>, key: impl Into<String>, storage: S) -> Self {
        Self {
            atom: atom.key(),
            key: key.into(),
            storage,
            codec: JsonCodec,
            _value: PhantomData,
        }
    }
}

impl<T, S, C> Persist<T, S, C>
where
    T: AtomValue + Serialize + DeserializeOwned,
    S: Storage,
    C: Codec,
{
    /// Use a different serialization format.
    pub fn with_codec<D: Codec>(self, codec: D) -> Persist<T, S, D> {
        Persist {
            atom: self.atom,
            key: self.key,
            storage: self.storage,
            codec,
            _value: PhantomData,
        }
    }

    /// The storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Delete the stored value. The value already cached in a store is
    /// kept; a store that materialises the atom afresh starts from its
    /// initial value.
    pub fn forget(&self) {
        if let Err(err) = self.storage.remove(&self.key) {
            warn!(key = %self.key, error = %err, "failed to remove persisted value");
        }
    }

    fn load(&self) -> Option<T> {
        let bytes = match self.storage.load(&self.key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %self.key, error = %err, "failed to load persisted value");
                return None;
            }
        };
        match self.codec.decode(&bytes) {
            Ok(value) => {
                debug!(key = %self.key, "loaded persisted value");
                Some(value)
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "ignoring undecodable persisted value");
                None
            }
        }
    }

    fn save(&self, value: &T) {
        let saved = self
            .codec
            .encode(value)
            .and_then(|bytes| self.storage.save(&self.key, &bytes));
        if let Err(err) = saved {
            warn!(key = %self.key, error = %err, "failed to persist value");
        }
    }
}

impl<T, S, C> Middleware for Persist<T, S, C>
where
    T: AtomValue + Serialize + DeserializeOwned,
    S: Storage,
    C: Codec,
{
    fn on_load(&self, atom: &AtomInfo) -> Option<Value> {
        if atom.key() != self.atom {
            return None;
        }
        self.load().map(|stored| Arc::new(stored) as Value)
    }

    fn on_write(&self, atom: &AtomInfo, value: Value, next: Next<'_>) -> Result<()> {
        if atom.key() != self.atom {
            return next.run(value);
        }

        let written = Value::clone(&value);
        next.run(value)?;
        if let Some(written) = written.downcast_ref::<T>() {
            self.save(written);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::middleware::History;
    use crate::reactive::Store;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        theme: String,
        font_size: u32,
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "molecule-persist-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn stored_value_replaces_initial_value() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save("count", b"41").unwrap();

        let count = Atom::new(0);
        let store = Store::builder()
            .middleware(Persist::new(&count, "count", storage.clone()))
            .build()
            .unwrap();

        assert_eq!(store.get(&count).unwrap(), 41);
    }

    #[test]
    fn functional_updates_start_from_the_stored_value() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save("count", b"41").unwrap();

        let count = Atom::new(0);
        let store = Store::builder()
            .middleware(Persist::new(&count, "count", storage.clone()))
            .build()
            .unwrap();

        assert_eq!(store.get(&count).unwrap(), 41);
        store.update(&count, |n| n + 1).unwrap();

        assert_eq!(store.get(&count).unwrap(), 42);
        assert_eq!(storage.load("count").unwrap(), Some(b"42".to_vec()));
    }

    #[test]
    fn loaded_value_is_held_like_a_write() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save("count", b"41").unwrap();

        let count = Atom::new(0);
        let store = Store::builder()
            .config(StoreConfig::default().with_max_age(Duration::ZERO))
            .middleware(Persist::new(&count, "count", storage))
            .build()
            .unwrap();

        store.get(&count).unwrap();
        store.reclaim();
        assert!(store.is_cached(&count));
        assert_eq!(store.snapshot().get(&count), Some(41));
    }

    #[test]
    fn history_jumps_are_not_masked_by_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let history = Arc::new(History::with_interval(1));
        let count = Atom::new(0);
        let store = Store::builder()
            .middleware(Persist::new(&count, "count", storage.clone()))
            .middleware(history.clone())
            .build()
            .unwrap();

        store.set(&count, 1).unwrap();
        store.set(&count, 2).unwrap();
        history.jump_to(&store, 0).unwrap();

        assert_eq!(store.get(&count).unwrap(), 1);
    }

    #[test]
    fn writes_are_saved_after_they_apply() {
        let storage = Arc::new(MemoryStorage::new());
        let count = Atom::new(0);
        let store = Store::builder()
            .middleware(Persist::new(&count, "count", storage.clone()))
            .build()
            .unwrap();

        store.set(&count, 7).unwrap();

        assert_eq!(storage.load("count").unwrap(), Some(b"7".to_vec()));
        assert_eq!(store.get(&count).unwrap(), 7);
    }

    #[test]
    fn other_atoms_are_untouched() {
        let storage = Arc::new(MemoryStorage::new());
        let persisted = Atom::new(0);
        let other = Atom::new(0);
        let store = Store::builder()
            .middleware(Persist::new(&persisted, "persisted", storage.clone()))
            .build()
            .unwrap();

        store.set(&other, 3).unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn undecodable_value_falls_back_to_the_store() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save("count", b"not json").unwrap();

        let count = Atom::new(5);
        let store = Store::builder()
            .middleware(Persist::new(&count, "count", storage))
            .build()
            .unwrap();

        assert_eq!(store.get(&count).unwrap(), 5);
    }

    #[test]
    fn derived_atoms_see_the_persisted_value() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save("base", b"10").unwrap();

        let base = Atom::new(1);
        let doubled = Atom::derived({
            let base = base.clone();
            move |get| Ok(get.get(&base)? * 2)
        });
        let store = Store::builder()
            .middleware(Persist::new(&base, "base", storage))
            .build()
            .unwrap();

        assert_eq!(store.get(&doubled).unwrap(), 20);
    }

    #[test]
    fn message_pack_round_trips_structs() {
        let storage = Arc::new(MemoryStorage::new());
        let prefs = Atom::new(Prefs {
            theme: "light".into(),
            font_size: 12,
        });
        let dark = Prefs {
            theme: "dark".into(),
            font_size: 14,
        };

        let store = Store::builder()
            .middleware(
                Persist::new(&prefs, "prefs", storage.clone()).with_codec(MessagePackCodec),
            )
            .build()
            .unwrap();
        store.set(&prefs, dark.clone()).unwrap();

        let bytes = storage.load("prefs").unwrap().unwrap();
        let decoded: Prefs = MessagePackCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, dark);
    }

    #[test]
    fn file_storage_survives_a_new_store() {
        let dir = temp_dir("survive");
        let name = Atom::new(String::from("anon"));

        {
            let store = Store::builder()
                .middleware(Persist::new(&name, "user/name", FileStorage::new(&dir)))
                .build()
                .unwrap();
            store.set(&name, "ada".to_string()).unwrap();
        }

        let fresh = Store::builder()
            .middleware(Persist::new(&name, "user/name", FileStorage::new(&dir)))
            .build()
            .unwrap();
        assert_eq!(fresh.get(&name).unwrap(), "ada");
        assert!(dir.join("user_name").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_storage_treats_missing_keys_as_empty() {
        let storage = FileStorage::new(temp_dir("missing"));
        assert!(storage.load("nothing").unwrap().is_none());
        storage.remove("nothing").unwrap();
    }

    #[test]
    fn forget_drops_the_stored_value() {
        let storage = Arc::new(MemoryStorage::new());
        let count = Atom::new(0);
        let persist = Arc::new(Persist::new(&count, "count", storage.clone()));
        let store = Store::builder()
            .middleware(persist.clone())
            .build()
            .unwrap();

        store.set(&count, 9).unwrap();
        persist.forget();

        assert!(!storage.contains("count"));
        assert_eq!(store.get(&count).unwrap(), 9);
    }
}
