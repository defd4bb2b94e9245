//! Mirroring of cache tables into an external key-value store.
//!
//! A mirrored call site writes its whole table to the store after every insertion and reads it
//! back on every lookup. The store is consulted in preference to memory: when it holds nothing
//! (or garbage) for the cache name, lookups miss.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::table::CachePair;

/// The name used for a persisted cache when the call site has none configured.
///
/// Call sites sharing a store need distinct names, otherwise they overwrite each other.
pub const DEFAULT_CACHE_NAME: &str = "local_persistence";

/// An error reading from or writing to a [`PersistenceStore`].
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence store failed")]
    Io(#[from] io::Error),
    #[error("malformed persisted cache")]
    Malformed(#[from] serde_json::Error),
}

/// A string-keyed store that cache tables are mirrored to.
///
/// No transactional guarantees are assumed: concurrent writers to the same name race, and the
/// last writer wins.
pub trait PersistenceStore: Send + Sync + fmt::Debug {
    /// Reads the value stored under `name`, if any.
    fn get(&self, name: &str) -> Result<Option<String>, PersistenceError>;

    /// Stores `value` under `name`, or removes the entry if `value` is `None`.
    fn set(&self, name: &str, value: Option<&str>) -> Result<(), PersistenceError>;
}

/// An in-process [`PersistenceStore`].
///
/// Clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.lock().get(name).cloned())
    }

    fn set(&self, name: &str, value: Option<&str>) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => entries.insert(name.to_owned(), value.to_owned()),
            None => entries.remove(name),
        };
        Ok(())
    }
}

/// A [`PersistenceStore`] keeping one JSON file per cache name inside a directory.
///
/// Writes go through a temporary file in the same directory which is then renamed into place,
/// so readers never observe a partially written table.
#[derive(Clone, Debug)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Opens a store in `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl PersistenceStore for FsStore {
    fn get(&self, name: &str) -> Result<Option<String>, PersistenceError> {
        match std::fs::read_to_string(self.path(name)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, name: &str, value: Option<&str>) -> Result<(), PersistenceError> {
        let path = self.path(name);
        match value {
            Some(value) => {
                let mut temp_file = NamedTempFile::new_in(&self.dir)?;
                temp_file.write_all(value.as_bytes())?;
                temp_file.persist(&path).map_err(|e| e.error)?;
            }
            None => match std::fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
        }
        Ok(())
    }
}

/// The mirror of one call site's table in a [`PersistenceStore`].
///
/// All failures are logged and otherwise swallowed: a table that cannot be read is a miss, a
/// table that cannot be written is simply not mirrored.
pub(crate) trait Mirror<T>: Send + Sync + fmt::Debug {
    fn load(&self, name: &str) -> Option<Vec<CachePair<T>>>;

    fn save(&self, name: &str, pairs: &VecDeque<CachePair<T>>);

    fn clear(&self, name: &str);
}

/// A [`Mirror`] serializing tables as JSON.
pub(crate) struct JsonMirror<T> {
    store: Arc<dyn PersistenceStore>,
    _table: PhantomData<fn() -> T>,
}

impl<T> JsonMirror<T> {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            store,
            _table: PhantomData,
        }
    }
}

impl<T> fmt::Debug for JsonMirror<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonMirror")
            .field("store", &self.store)
            .finish()
    }
}

impl<T> Mirror<T> for JsonMirror<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self, name: &str) -> Option<Vec<CachePair<T>>> {
        let raw = match self.store.get(name) {
            Ok(raw) => raw?,
            Err(err) => {
                let err = &err as &dyn std::error::Error;
                tracing::warn!(error = err, cache = name, "Failed to read persisted cache");
                metric!(counter("memoize.persistence.error") += 1, "cache" => name, "op" => "read");
                return None;
            }
        };

        // A busted table may be stored as an explicit `null`.
        match serde_json::from_str::<Option<Vec<CachePair<T>>>>(&raw) {
            Ok(pairs) => pairs,
            Err(err) => {
                let err = &err as &dyn std::error::Error;
                tracing::warn!(error = err, cache = name, "Discarding malformed persisted cache");
                metric!(counter("memoize.persistence.error") += 1, "cache" => name, "op" => "parse");
                None
            }
        }
    }

    fn save(&self, name: &str, pairs: &VecDeque<CachePair<T>>) {
        let result = serde_json::to_string(pairs)
            .map_err(PersistenceError::from)
            .and_then(|raw| self.store.set(name, Some(&raw)));
        if let Err(err) = result {
            let err = &err as &dyn std::error::Error;
            tracing::error!(error = err, cache = name, "Failed to persist cache");
            metric!(counter("memoize.persistence.error") += 1, "cache" => name, "op" => "write");
        }
    }

    fn clear(&self, name: &str) {
        if let Err(err) = self.store.set(name, None) {
            let err = &err as &dyn std::error::Error;
            tracing::error!(error = err, cache = name, "Failed to clear persisted cache");
            metric!(counter("memoize.persistence.error") += 1, "cache" => name, "op" => "clear");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::caching::NormalizedArgs;
    use crate::test;

    fn table() -> VecDeque<CachePair<serde_json::Value>> {
        VecDeque::from([CachePair {
            parameters: NormalizedArgs::from(vec![json!("test")]),
            result: json!({"payload": "test"}),
            created_at: None,
        }])
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let mirror = JsonMirror::new(Arc::new(store.clone()));

        mirror.save("users", &table());
        insta::assert_snapshot!(
            store.get("users").unwrap().unwrap(),
            @r#"[{"parameters":["test"],"result":{"payload":"test"},"created_at":null}]"#
        );
        assert_eq!(mirror.load("users"), Some(Vec::from(table())));

        mirror.clear("users");
        assert_eq!(store.get("users").unwrap(), None);
        assert_eq!(mirror.load("users"), None);
    }

    #[test]
    fn test_malformed_table_is_a_miss() {
        test::setup();

        let store = MemoryStore::new();
        store.set("users", Some("{not json")).unwrap();
        let mirror = JsonMirror::<serde_json::Value>::new(Arc::new(store.clone()));
        assert_eq!(mirror.load("users"), None);

        store.set("users", Some("null")).unwrap();
        assert_eq!(mirror.load("users"), None);
    }

    #[test]
    fn test_fs_store() {
        test::setup();

        let dir = test::tempdir();
        let store = FsStore::new(dir.path().join("persisted")).unwrap();
        assert_eq!(store.get("users/../all").unwrap(), None);

        store.set("users/../all", Some("[]")).unwrap();
        assert!(store.dir().join("users_.._all.json").is_file());
        assert_eq!(store.get("users/../all").unwrap().as_deref(), Some("[]"));

        store.set("users/../all", None).unwrap();
        assert_eq!(store.get("users/../all").unwrap(), None);
        // removing an absent entry is fine
        store.set("users/../all", None).unwrap();
    }

    #[test]
    fn test_fs_mirror_survives_reopen() {
        let dir = test::tempdir();
        {
            let store = FsStore::new(dir.path()).unwrap();
            JsonMirror::new(Arc::new(store)).save("users", &table());
        }

        let store = FsStore::new(dir.path()).unwrap();
        let mirror = JsonMirror::new(Arc::new(store));
        assert_eq!(mirror.load("users"), Some(Vec::from(table())));
    }
}
