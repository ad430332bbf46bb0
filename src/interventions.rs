//! Intervention and room-block mutations as the UI calls them.
//!
//! When the document store is reachable each call writes straight through
//! and bypasses the queue. When it is not (or the write fails with
//! `unavailable`) the mutation is deferred: it is enqueued for the sync
//! engine and applied to the offline cache so the UI view stays consistent.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::OfflineCache;
use crate::models::{
    generate_local_id, is_local_id, ActionType, BlockedRoom, Intervention, MutationResult,
    ToggleRoomBlockPayload, INTERVENTIONS_COLLECTION,
};
use crate::queue::PendingActionQueue;
use crate::remote::{RemoteError, RemoteStore};
use crate::sync::{apply_room_block, creation_data, timestamp_value};

pub struct InterventionService {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<PendingActionQueue>,
    cache: Arc<OfflineCache>,
}

/// Where a mutation ended up when it did not fail.
enum Route {
    Remote,
    Deferred,
}

impl InterventionService {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        queue: Arc<PendingActionQueue>,
        cache: Arc<OfflineCache>,
    ) -> Self {
        Self {
            remote,
            queue,
            cache,
        }
    }

    /// Local id not yet used by any cached record.
    fn fresh_local_id(&self) -> String {
        let cached = self.cache.interventions();
        let base = generate_local_id();
        let mut id = base.clone();
        let mut n = 1;
        while cached.iter().any(|i| i.id == id) {
            id = format!("{base}-{n}");
            n += 1;
        }
        id
    }

    /// Server id for `id`, or `None` while a local record has not reached
    /// the store yet.
    fn server_id(&self, id: &str) -> Option<String> {
        if is_local_id(id) {
            self.cache.id_mappings().get(id).cloned()
        } else {
            Some(id.to_string())
        }
    }

    /// Server id to write through to, or `None` when the mutation has to be
    /// deferred.
    async fn reachable_target(&self, id: &str) -> Option<String> {
        let target = self.server_id(id)?;
        if self.remote.is_reachable().await {
            Some(target)
        } else {
            None
        }
    }

    fn defer(&self, action_type: ActionType, payload: Value) {
        let action = self.queue.enqueue(action_type, payload);
        info!(action_id = %action.id, action_type = %action_type, "Mutation deferred until next sync");
    }

    fn rejected(&self, operation: &str, err: &RemoteError) -> MutationResult {
        warn!(operation, error = %err, "Document store rejected mutation");
        MutationResult::failed(err.user_message())
    }

    /// Create an intervention. Any id on `draft` is replaced by the one the
    /// store assigns, or by a local id when the create is deferred.
    pub async fn create(&self, user_id: &str, mut draft: Intervention) -> MutationResult {
        let now = Utc::now();
        if draft.created_by.is_none() {
            draft.created_by = Some(user_id.to_string());
        }
        if draft.created_at.is_none() {
            draft.created_at = Some(now);
        }
        draft.updated_at = Some(now);

        if self.remote.is_reachable().await {
            match self
                .remote
                .create(INTERVENTIONS_COLLECTION, creation_data(&draft))
                .await
            {
                Ok(id) => {
                    draft.id = id.clone();
                    self.cache.upsert_intervention(draft);
                    return MutationResult::ok(Some(id));
                }
                Err(RemoteError::Unavailable(_)) => {}
                Err(e) => return self.rejected("create", &e),
            }
        }

        draft.id = self.fresh_local_id();
        let payload = match serde_json::to_value(&draft) {
            Ok(payload) => payload,
            Err(e) => return MutationResult::failed(format!("Invalid intervention: {e}")),
        };
        self.defer(ActionType::AddIntervention, payload);
        let id = draft.id.clone();
        self.cache.upsert_intervention(draft);
        MutationResult::ok(Some(id))
    }

    /// Merge `changes` into intervention `id`.
    pub async fn update(&self, id: &str, mut changes: Map<String, Value>) -> MutationResult {
        changes.remove("id");
        changes
            .entry("updatedAt")
            .or_insert_with(|| timestamp_value(Utc::now()));

        let route = match self.reachable_target(id).await {
            Some(target) => match self
                .remote
                .update(INTERVENTIONS_COLLECTION, &target, changes.clone())
                .await
            {
                Ok(()) => Route::Remote,
                Err(RemoteError::Unavailable(_)) => Route::Deferred,
                Err(e) => return self.rejected("update", &e),
            },
            None => Route::Deferred,
        };
        if let Route::Deferred = route {
            let payload = serde_json::json!({ "id": id, "changes": changes });
            self.defer(ActionType::UpdateIntervention, payload);
        }

        let mut cached = self.cache.interventions();
        if let Some(existing) = cached.iter_mut().find(|i| i.id == id) {
            existing.apply_changes(&changes);
            self.cache.save_interventions(&cached);
        }
        MutationResult::ok(Some(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> MutationResult {
        let route = match self.reachable_target(id).await {
            Some(target) => match self.remote.delete(INTERVENTIONS_COLLECTION, &target).await {
                Ok(()) => Route::Remote,
                Err(RemoteError::Unavailable(_)) => Route::Deferred,
                Err(e) => return self.rejected("delete", &e),
            },
            None => Route::Deferred,
        };
        if let Route::Deferred = route {
            self.defer(
                ActionType::DeleteIntervention,
                serde_json::json!({ "id": id }),
            );
        }
        self.cache.remove_intervention(id);
        MutationResult::ok(Some(id.to_string()))
    }

    /// Block `room_number` (with an optional reason) or release its blocks.
    pub async fn toggle_room_block(
        &self,
        user_id: &str,
        room_number: &str,
        blocked: bool,
        reason: Option<String>,
    ) -> MutationResult {
        let payload = ToggleRoomBlockPayload {
            room_number: room_number.to_string(),
            blocked,
            reason,
            user_id: user_id.to_string(),
        };

        let route = if self.remote.is_reachable().await {
            match apply_room_block(self.remote.as_ref(), &payload).await {
                Ok(()) => Route::Remote,
                Err(RemoteError::Unavailable(_)) => Route::Deferred,
                Err(e) => return self.rejected("toggle_room_block", &e),
            }
        } else {
            Route::Deferred
        };
        if let Route::Deferred = route {
            match serde_json::to_value(&payload) {
                Ok(value) => self.defer(ActionType::ToggleRoomBlock, value),
                Err(e) => return MutationResult::failed(format!("Invalid room block: {e}")),
            }
        }

        let mut rooms = self.cache.blocked_rooms();
        rooms.retain(|r| r.room_number != room_number);
        if blocked {
            let now = Utc::now();
            rooms.push(BlockedRoom {
                id: generate_local_id(),
                room_number: payload.room_number,
                reason: payload.reason,
                blocked_by: Some(payload.user_id),
                active: true,
                created_at: Some(now),
                updated_at: Some(now),
            });
        }
        self.cache.save_blocked_rooms(&rooms);
        MutationResult::ok(None)
    }
}
