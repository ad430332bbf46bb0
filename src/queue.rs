//! Durable, ordered queue of pending mutations.
//!
//! The whole list lives in memory and is serialized to key-value storage on
//! every change. A failed write is logged and reported as `false`; the
//! in-memory list keeps the change, so memory and storage can drift apart
//! until the next successful write.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::local_store::KeyValueStore;
use crate::models::{ActionType, DeadLetter, PendingAction};

pub const PENDING_ACTIONS_KEY: &str = "pendingActions";
pub const DEAD_ACTIONS_KEY: &str = "deadActions";

struct QueueState {
    pending: Vec<PendingAction>,
    dead: Vec<DeadLetter>,
}

/// The pending-action queue. Build one per process and share it by `Arc`.
pub struct PendingActionQueue {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<QueueState>,
}

fn load_list<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Vec<T> {
    match store.get_item(key) {
        Ok(Some(raw)) => match serde_json::from_str::<Vec<T>>(&raw) {
            Ok(list) => list,
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable queue data");
                Vec::new()
            }
        },
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(key, error = %e, "Failed to read queue from storage");
            Vec::new()
        }
    }
}

fn persist_list<T: Serialize>(store: &dyn KeyValueStore, key: &str, list: &[T]) -> bool {
    let raw = match serde_json::to_string(list) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(key, error = %e, "Failed to serialize queue");
            return false;
        }
    };
    match store.set_item(key, &raw) {
        Ok(()) => true,
        Err(e) => {
            warn!(key, error = %e, "Failed to persist queue");
            false
        }
    }
}

impl PendingActionQueue {
    /// Load the queue and dead-letter list from `store`.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let pending: Vec<PendingAction> = load_list(store.as_ref(), PENDING_ACTIONS_KEY);
        let dead: Vec<DeadLetter> = load_list(store.as_ref(), DEAD_ACTIONS_KEY);
        if !pending.is_empty() || !dead.is_empty() {
            info!(
                pending = pending.len(),
                dead = dead.len(),
                "Loaded pending action queue"
            );
        }
        Self {
            store,
            state: Mutex::new(QueueState { pending, dead }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist_pending(&self, state: &QueueState) -> bool {
        persist_list(self.store.as_ref(), PENDING_ACTIONS_KEY, &state.pending)
    }

    fn persist_dead(&self, state: &QueueState) -> bool {
        persist_list(self.store.as_ref(), DEAD_ACTIONS_KEY, &state.dead)
    }

    /// Append a new action. Every call adds an entry, even when an
    /// equivalent one is already queued.
    pub fn enqueue(&self, action_type: ActionType, payload: Value) -> PendingAction {
        let mut state = self.lock();
        let now = Utc::now();
        let base = format!("pending_{}", now.timestamp_millis());
        let mut id = base.clone();
        let mut n = 1;
        while state.pending.iter().any(|a| a.id == id) {
            id = format!("{base}-{n}");
            n += 1;
        }

        let action = PendingAction {
            id,
            action_type,
            payload,
            timestamp: now,
            attempts: 0,
            last_error: None,
        };
        state.pending.push(action.clone());
        let persisted = self.persist_pending(&state);
        debug!(
            action_id = %action.id,
            action_type = %action_type,
            persisted,
            "Enqueued pending action"
        );
        action
    }

    /// Snapshot of the queue in insertion order.
    pub fn list(&self) -> Vec<PendingAction> {
        self.lock().pending.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Remove the entry with `id`. Returns whether one was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.pending.iter().position(|a| a.id == id) else {
            return false;
        };
        state.pending.remove(pos);
        self.persist_pending(&state);
        true
    }

    /// Drop every pending action. Returns whether storage was updated.
    pub fn clear(&self) -> bool {
        let mut state = self.lock();
        state.pending.clear();
        self.persist_pending(&state)
    }

    /// Drop queued creates and updates of intervention `record_id`. Returns
    /// the ids of the removed actions.
    pub fn cancel_record_writes(&self, record_id: &str) -> Vec<String> {
        let mut state = self.lock();
        let mut cancelled = Vec::new();
        state.pending.retain(|a| {
            let targets_record = matches!(
                a.action_type,
                ActionType::AddIntervention | ActionType::UpdateIntervention
            ) && a.payload.get("id").and_then(Value::as_str) == Some(record_id);
            if targets_record {
                cancelled.push(a.id.clone());
            }
            !targets_record
        });
        if !cancelled.is_empty() {
            self.persist_pending(&state);
            info!(record_id, count = cancelled.len(), "Cancelled queued writes of deleted record");
        }
        cancelled
    }

    /// Ids of interventions referenced by any queued action.
    pub fn referenced_record_ids(&self) -> Vec<String> {
        self.lock()
            .pending
            .iter()
            .filter(|a| a.action_type != ActionType::ToggleRoomBlock)
            .filter_map(|a| a.payload.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Bump the attempt counter of `id` and remember the error.
    pub fn record_failure(&self, id: &str, error: &str) -> bool {
        let mut state = self.lock();
        let Some(action) = state.pending.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        action.attempts += 1;
        action.last_error = Some(error.to_string());
        self.persist_pending(&state);
        true
    }

    /// Replace the payload of `id`, keeping its position and id.
    pub fn replace_payload(&self, id: &str, payload: Value) -> bool {
        let mut state = self.lock();
        let Some(action) = state.pending.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        action.payload = payload;
        self.persist_pending(&state);
        true
    }

    /// Move `id` from the active queue to the dead-letter list.
    pub fn dead_letter(&self, id: &str, error: &str) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.pending.iter().position(|a| a.id == id) else {
            return false;
        };
        let mut action = state.pending.remove(pos);
        action.last_error = Some(error.to_string());
        warn!(
            action_id = %action.id,
            action_type = %action.action_type,
            attempts = action.attempts,
            error,
            "Pending action permanently rejected; moved to dead letters"
        );
        state.dead.push(DeadLetter {
            action,
            error: error.to_string(),
            dead_at: Utc::now(),
        });
        // Dead list first: a crash in between leaves a duplicate, never a loss.
        self.persist_dead(&state);
        self.persist_pending(&state);
        true
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    /// Put every dead letter back at the end of the active queue with its
    /// attempt counter reset. Returns how many were requeued.
    pub fn requeue_dead_letters(&self) -> usize {
        let mut state = self.lock();
        if state.dead.is_empty() {
            return 0;
        }
        let revived: Vec<PendingAction> = state
            .dead
            .drain(..)
            .map(|d| PendingAction {
                attempts: 0,
                ..d.action
            })
            .collect();
        let count = revived.len();
        state.pending.extend(revived);
        self.persist_pending(&state);
        self.persist_dead(&state);
        info!(count, "Requeued dead-letter actions");
        count
    }
}
