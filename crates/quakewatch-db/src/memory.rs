//! In-process snapshot storage.
//!
//! Used when no `Dragonfly` URL is configured and throughout the test
//! suites. Values are kept in their serialized form so a load after a save
//! goes through the same JSON round trip as the networked store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::DbError;

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    writes: u64,
}

/// A cloneable key/value store held in memory.
///
/// Clones share the same storage, so a test can keep a handle and inspect
/// what the engine persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw string value.
    pub fn set(&self, key: &str, value: String) {
        let Ok(mut inner) = self.inner.lock() else {
            tracing::warn!(key, "memory store lock poisoned, dropping write");
            return;
        };
        inner.values.insert(key.to_owned(), value);
        inner.writes = inner.writes.saturating_add(1);
    }

    /// Read a raw string value.
    pub fn get(&self, key: &str) -> Option<String> {
        let Ok(inner) = self.inner.lock() else {
            return None;
        };
        inner.values.get(key).cloned()
    }

    /// Remove a value; a missing key is not an error.
    pub fn delete(&self, key: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.values.remove(key);
        }
    }

    /// Read an integer value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidValue`] if the stored value is not an integer.
    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, DbError> {
        self.get(key)
            .map(|raw| {
                raw.parse::<i64>().map_err(|e| DbError::InvalidValue {
                    key: key.to_owned(),
                    reason: format!("not a valid i64: {e}"),
                })
            })
            .transpose()
    }

    /// Number of writes performed so far.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().map_or(0, |inner| inner.writes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let store = MemoryStore::new();
        let handle = store.clone();
        store.set("k", "42".to_owned());
        assert_eq!(handle.get_i64("k").unwrap(), Some(42));
        assert_eq!(handle.write_count(), 1);
        handle.delete("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn rejects_non_integer_values() {
        let store = MemoryStore::new();
        store.set("k", "soon".to_owned());
        assert!(matches!(
            store.get_i64("k"),
            Err(DbError::InvalidValue { .. })
        ));
    }
}
