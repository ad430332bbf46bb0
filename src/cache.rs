//! Offline snapshots of server collections and sync bookkeeping.
//!
//! Snapshots are replaced wholesale; nothing here merges field by field.
//! Every failure is logged and swallowed so a broken cache never blocks the
//! caller.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::local_store::KeyValueStore;
use crate::models::{BlockedRoom, Intervention};

pub const INTERVENTIONS_KEY: &str = "offline_interventions";
pub const BLOCKED_ROOMS_KEY: &str = "offline_blockedRooms";
pub const ID_MAPPINGS_KEY: &str = "idMappings";
const LAST_SYNC_KEY_PREFIX: &str = "lastSync_";

pub struct OfflineCache {
    store: Arc<dyn KeyValueStore>,
}

impl OfflineCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Serialize `value` under `key`. Returns `false` (and logs) on failure.
    pub fn save_data<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize cache entry");
                return false;
            }
        };
        match self.store.set_item(key, &raw) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to save cache entry");
                false
            }
        }
    }

    /// Read and deserialize `key`. Missing and unreadable entries are `None`.
    pub fn load_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get_item(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "Failed to read cache entry");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove_item(key) {
            warn!(key, error = %e, "Failed to remove cache entry");
        }
    }

    // -- interventions ------------------------------------------------------

    pub fn interventions(&self) -> Vec<Intervention> {
        self.load_data(INTERVENTIONS_KEY).unwrap_or_default()
    }

    pub fn save_interventions(&self, interventions: &[Intervention]) -> bool {
        self.save_data(INTERVENTIONS_KEY, interventions)
    }

    /// Insert or replace one intervention in the snapshot (by id).
    pub fn upsert_intervention(&self, intervention: Intervention) -> bool {
        let mut all = self.interventions();
        match all.iter_mut().find(|i| i.id == intervention.id) {
            Some(existing) => *existing = intervention,
            None => all.insert(0, intervention),
        }
        self.save_interventions(&all)
    }

    pub fn remove_intervention(&self, id: &str) -> bool {
        let mut all = self.interventions();
        let before = all.len();
        all.retain(|i| i.id != id);
        if all.len() == before {
            return false;
        }
        self.save_interventions(&all)
    }

    // -- blocked rooms ------------------------------------------------------

    pub fn blocked_rooms(&self) -> Vec<BlockedRoom> {
        self.load_data(BLOCKED_ROOMS_KEY).unwrap_or_default()
    }

    pub fn save_blocked_rooms(&self, rooms: &[BlockedRoom]) -> bool {
        self.save_data(BLOCKED_ROOMS_KEY, rooms)
    }

    // -- last sync ----------------------------------------------------------

    pub fn last_sync(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.load_data(&format!("{LAST_SYNC_KEY_PREFIX}{user_id}"))
    }

    pub fn set_last_sync(&self, user_id: &str, at: DateTime<Utc>) -> bool {
        self.save_data(&format!("{LAST_SYNC_KEY_PREFIX}{user_id}"), &at)
    }

    // -- id mappings --------------------------------------------------------

    /// `local id -> server id` for every local-origin record created remotely.
    pub fn id_mappings(&self) -> HashMap<String, String> {
        self.load_data(ID_MAPPINGS_KEY).unwrap_or_default()
    }

    pub fn save_id_mapping(&self, local_id: &str, server_id: &str) -> bool {
        let mut mappings = self.id_mappings();
        mappings.insert(local_id.to_string(), server_id.to_string());
        self.save_data(ID_MAPPINGS_KEY, &mappings)
    }

    /// Drop every id mapping for which `keep(local_id, server_id)` is false.
    /// Returns how many were dropped.
    pub fn retain_id_mappings(&self, keep: impl Fn(&str, &str) -> bool) -> usize {
        let mut mappings = self.id_mappings();
        let before = mappings.len();
        mappings.retain(|local, server| keep(local, server));
        let dropped = before - mappings.len();
        if dropped > 0 {
            self.save_data(ID_MAPPINGS_KEY, &mappings);
        }
        dropped
    }

    /// Forget cached snapshots, id mappings and the last-sync marker of
    /// `user_id`. The pending queue is left alone.
    pub fn clear_all(&self, user_id: &str) {
        self.remove(INTERVENTIONS_KEY);
        self.remove(BLOCKED_ROOMS_KEY);
        self.remove(ID_MAPPINGS_KEY);
        self.remove(&format!("{LAST_SYNC_KEY_PREFIX}{user_id}"));
    }
}
