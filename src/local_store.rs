//! Key-value persistence shim used by the offline queue and cache.
//!
//! Mirrors browser-style `getItem`/`setItem`/`removeItem` semantics: string
//! keys, string values, synchronous calls, and writes that may fail (quota,
//! I/O). Two backends: SQLite for durable storage and an in-memory map with
//! an optional byte quota.

use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::DbState;

/// Synchronous string key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, String>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), String>;
    fn remove_item(&self, key: &str) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

/// Durable store on the `kv_store` table.
pub struct SqliteKeyValueStore {
    db: Arc<DbState>,
}

impl SqliteKeyValueStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("kv get {key}: {e}"))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value],
        )
        .map_err(|e| format!("kv set {key}: {e}"))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .map_err(|e| format!("kv remove {key}: {e}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-process store. With a quota set, a write that would push the total of
/// key and value bytes past it fails with `QuotaExceededError`.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    items: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn used_bytes(items: &HashMap<String, String>, skip_key: &str) -> usize {
        items
            .iter()
            .filter(|(k, _)| k.as_str() != skip_key)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, String> {
        let items = self.items.lock().map_err(|e| e.to_string())?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), String> {
        let mut items = self.items.lock().map_err(|e| e.to_string())?;
        if let Some(quota) = self.quota_bytes {
            let projected = Self::used_bytes(&items, key) + key.len() + value.len();
            if projected > quota {
                return Err(format!(
                    "QuotaExceededError: writing {key} needs {projected} bytes (quota {quota})"
                ));
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), String> {
        let mut items = self.items.lock().map_err(|e| e.to_string())?;
        items.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_sqlite_store_set_get_overwrite_remove() {
        let store = SqliteKeyValueStore::new(Arc::new(db::open_in_memory().unwrap()));

        assert_eq!(store.get_item("pendingActions").unwrap(), None);
        store.set_item("pendingActions", "[]").unwrap();
        store.set_item("pendingActions", "[1]").unwrap();
        assert_eq!(
            store.get_item("pendingActions").unwrap().as_deref(),
            Some("[1]")
        );

        store.remove_item("pendingActions").unwrap();
        assert_eq!(store.get_item("pendingActions").unwrap(), None);
        // Removing a missing key is fine.
        store.remove_item("pendingActions").unwrap();
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteKeyValueStore::new(Arc::new(db::init(dir.path()).unwrap()));
            store.set_item("lastSync_tech-1", "2026-03-01T08:00:00Z").unwrap();
        }
        let store = SqliteKeyValueStore::new(Arc::new(db::init(dir.path()).unwrap()));
        assert_eq!(
            store.get_item("lastSync_tech-1").unwrap().as_deref(),
            Some("2026-03-01T08:00:00Z")
        );
    }

    #[test]
    fn test_memory_store_quota_rejects_oversized_write() {
        let store = MemoryKeyValueStore::with_quota(16);
        store.set_item("k", "short").unwrap();

        let err = store.set_item("big", "0123456789abcdef").unwrap_err();
        assert!(err.contains("QuotaExceededError"));
        assert_eq!(store.get_item("big").unwrap(), None);

        // Replacing an existing key only counts the new value.
        store.set_item("k", "0123456789abcd").unwrap();
    }
}
