//! Sync engine for offline interventions.
//!
//! A sync cycle replays the pending-action queue against the remote store
//! in enqueue order, pushes interventions that only exist locally, then
//! refreshes the offline cache from the server and stamps the last-sync
//! time. Individual action failures never abort a cycle: the action stays
//! queued (or is parked as a dead letter) and the loop moves on.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::OfflineCache;
use crate::db::{self, DbState, SyncRun};
use crate::models::{
    is_local_id, ActionType, BlockedRoom, DeleteInterventionPayload, Intervention, PendingAction,
    ToggleRoomBlockPayload, UpdateInterventionPayload, Versioned, BLOCKED_ROOMS_COLLECTION,
    INTERVENTIONS_COLLECTION, USERS_COLLECTION,
};
use crate::queue::PendingActionQueue;
use crate::remote::{Document, OrderBy, QueryFilter, RemoteError, RemoteStore, WriteOp};

/// Default age after which a new sync cycle is due.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Tunables for the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub staleness_threshold: Duration,
    /// Park actions rejected with a permanent error instead of retrying them
    /// on every cycle.
    pub dead_letter_permanent_failures: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            dead_letter_permanent_failures: false,
        }
    }
}

/// Result of `sync_all`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    /// Pending actions applied and removed from the queue.
    pub synced_count: usize,
    /// Local-only interventions created remotely.
    pub pushed_count: usize,
    /// Actions and pushes that failed and will be retried.
    pub failed_count: usize,
    pub dead_lettered: usize,
    /// True when this call was folded into a sync already in flight.
    pub coalesced: bool,
    /// Local ids promoted to server ids during this call.
    pub id_mappings: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn coalesced() -> Self {
        Self {
            success: true,
            coalesced: true,
            ..Self::default()
        }
    }

    /// Fold a follow-up cycle for the same user into this result. Any failed
    /// cycle fails the whole call and the first error is kept.
    fn absorb(&mut self, cycle: SyncResult) {
        self.success &= cycle.success;
        self.synced_count += cycle.synced_count;
        self.pushed_count += cycle.pushed_count;
        self.failed_count += cycle.failed_count;
        self.dead_lettered += cycle.dead_lettered;
        self.id_mappings.extend(cycle.id_mappings);
        if self.error.is_none() {
            self.error = cycle.error;
        }
    }
}

/// Snapshot of queue and history state for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: usize,
    pub dead_letter_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub needs_sync: bool,
    pub is_syncing: bool,
    pub last_run: Option<SyncRun>,
}

/// Untyped write as handed over by callers of `batch_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    #[serde(rename = "type")]
    pub op_type: String,
    pub collection: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

/// Last-writer-wins between two versions of the same record.
///
/// Compares `updatedAt` (falling back to `createdAt`) and returns the newer
/// record whole. Ties and records without any timestamp go to the server.
pub fn resolve_conflicts<T: Versioned>(local: T, server: T) -> T {
    if local.version_time() > server.version_time() {
        local
    } else {
        server
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum ReplayError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("malformed {0} payload: {1}")]
    Malformed(ActionType, String),
}

impl ReplayError {
    fn is_permanent(&self) -> bool {
        match self {
            ReplayError::Remote(e) => e.is_permanent(),
            ReplayError::Malformed(..) => true,
        }
    }
}

#[derive(Debug)]
enum Replay {
    Applied { promoted: Option<(String, String)> },
    /// Cannot run yet; stays queued without counting as a failure.
    Deferred(&'static str),
}

fn parse_payload<T: serde::de::DeserializeOwned>(action: &PendingAction) -> Result<T, ReplayError> {
    serde_json::from_value(action.payload.clone())
        .map_err(|e| ReplayError::Malformed(action.action_type, e.to_string()))
}

pub(crate) fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Document body for creating `record` remotely, with missing timestamps
/// stamped now.
pub(crate) fn creation_data(record: &Intervention) -> Map<String, Value> {
    let mut data = record.to_document_data();
    let now = timestamp_value(Utc::now());
    data.entry("createdAt").or_insert_with(|| now.clone());
    data.entry("updatedAt").or_insert(now);
    data
}

/// Per-cycle view of local ids: known server ids and locals deleted before
/// they ever reached the server.
#[derive(Default)]
struct LocalIds {
    mappings: HashMap<String, String>,
    deleted: HashSet<String>,
    /// Queued actions dropped because their record was deleted locally.
    cancelled: HashSet<String>,
}

impl LocalIds {
    fn is_settled(&self, local_id: &str) -> bool {
        self.mappings.contains_key(local_id) || self.deleted.contains(local_id)
    }
}

/// Write a room block or release every active block on the room.
pub(crate) async fn apply_room_block(
    remote: &dyn RemoteStore,
    payload: &ToggleRoomBlockPayload,
) -> Result<(), RemoteError> {
    let now = timestamp_value(Utc::now());
    if payload.blocked {
        let mut data = Map::new();
        data.insert("roomNumber".into(), Value::String(payload.room_number.clone()));
        data.insert(
            "reason".into(),
            payload.reason.clone().map(Value::String).unwrap_or(Value::Null),
        );
        data.insert("blockedBy".into(), Value::String(payload.user_id.clone()));
        data.insert("active".into(), Value::Bool(true));
        data.insert("createdAt".into(), now.clone());
        data.insert("updatedAt".into(), now);
        remote.create(BLOCKED_ROOMS_COLLECTION, data).await?;
        return Ok(());
    }

    let active = remote
        .query(
            BLOCKED_ROOMS_COLLECTION,
            &[
                QueryFilter::eq("roomNumber", payload.room_number.clone()),
                QueryFilter::eq("active", true),
            ],
            None,
        )
        .await?;
    let writes: Vec<WriteOp> = active
        .iter()
        .filter_map(|doc| doc.get("id").and_then(Value::as_str))
        .map(|id| {
            let mut data = Map::new();
            data.insert("active".into(), Value::Bool(false));
            data.insert("unblockedBy".into(), Value::String(payload.user_id.clone()));
            data.insert("unblockedAt".into(), now.clone());
            data.insert("updatedAt".into(), now.clone());
            WriteOp::Update {
                collection: BLOCKED_ROOMS_COLLECTION.to_string(),
                id: id.to_string(),
                data,
            }
        })
        .collect();
    if writes.is_empty() {
        debug!(room = %payload.room_number, "No active block to release");
        return Ok(());
    }
    remote.batch_commit(writes).await
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct SyncRequest {
    user_id: String,
    local_records: Vec<Intervention>,
}

#[derive(Default)]
struct GateState {
    running: bool,
    /// At most one follow-up per user, in arrival order.
    queued: Vec<SyncRequest>,
}

impl GateState {
    fn enqueue(&mut self, request: SyncRequest) {
        match self.queued.iter_mut().find(|q| q.user_id == request.user_id) {
            Some(slot) => *slot = request,
            None => self.queued.push(request),
        }
    }

    fn next(&mut self) -> Option<SyncRequest> {
        if self.queued.is_empty() {
            None
        } else {
            Some(self.queued.remove(0))
        }
    }
}

/// Releases the gate if a running sync is dropped mid-flight.
struct GateGuard<'a> {
    gate: &'a Mutex<GateState>,
    armed: bool,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
            gate.running = false;
        }
    }
}

pub struct SyncService {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<PendingActionQueue>,
    cache: Arc<OfflineCache>,
    history: Option<Arc<DbState>>,
    settings: SyncSettings,
    gate: Mutex<GateState>,
}

impl SyncService {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        queue: Arc<PendingActionQueue>,
        cache: Arc<OfflineCache>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            remote,
            queue,
            cache,
            history: None,
            settings,
            gate: Mutex::new(GateState::default()),
        }
    }

    /// Record every cycle in the `sync_runs` table of `db`.
    pub fn with_history(mut self, db: Arc<DbState>) -> Self {
        self.history = Some(db);
        self
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn queue(&self) -> &Arc<PendingActionQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<OfflineCache> {
        &self.cache
    }

    fn lock_gate(&self) -> MutexGuard<'_, GateState> {
        self.gate.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// True if there is queued work, no sync was ever recorded for
    /// `user_id`, or the last one is older than the staleness threshold.
    pub fn needs_sync(&self, user_id: &str) -> bool {
        if !self.queue.is_empty() {
            return true;
        }
        let Some(last) = self.cache.last_sync(user_id) else {
            return true;
        };
        let age = Utc::now().signed_duration_since(last);
        match age.to_std() {
            Ok(age) => age > self.settings.staleness_threshold,
            // Last sync is in the future (clock skew): treat as fresh.
            Err(_) => false,
        }
    }

    /// Run a full sync cycle for `user_id`.
    ///
    /// If a sync is already running, the request becomes the queued
    /// follow-up for its user (replacing an earlier one for the same user)
    /// and this call returns at once with `coalesced = true`. The running
    /// call executes every follow-up before it returns, but only folds
    /// cycles for its own user into its result.
    pub async fn sync_all(&self, user_id: &str, local_records: &[Intervention]) -> SyncResult {
        {
            let mut gate = self.lock_gate();
            if gate.running {
                gate.enqueue(SyncRequest {
                    user_id: user_id.to_string(),
                    local_records: local_records.to_vec(),
                });
                info!(user_id, "Sync already running; queued follow-up");
                return SyncResult::coalesced();
            }
            gate.running = true;
        }
        let mut guard = GateGuard {
            gate: &self.gate,
            armed: true,
        };

        let mut total = self.run_cycle(user_id, local_records).await;
        loop {
            let next = {
                let mut gate = self.lock_gate();
                let next = gate.next();
                if next.is_none() {
                    gate.running = false;
                    guard.armed = false;
                }
                next
            };
            match next {
                Some(request) => {
                    debug!(user_id = %request.user_id, "Running queued follow-up sync");
                    let cycle = self
                        .run_cycle(&request.user_id, &request.local_records)
                        .await;
                    if request.user_id == user_id {
                        total.absorb(cycle);
                    } else if !cycle.success {
                        warn!(
                            user_id = %request.user_id,
                            error = cycle.error.as_deref().unwrap_or_default(),
                            "Queued follow-up sync failed"
                        );
                    }
                }
                None => break,
            }
        }
        total
    }

    async fn run_cycle(&self, user_id: &str, local_records: &[Intervention]) -> SyncResult {
        let started_at = Utc::now();
        let mut result = SyncResult::default();
        let mut locals = LocalIds {
            mappings: self.cache.id_mappings(),
            deleted: HashSet::new(),
            cancelled: HashSet::new(),
        };

        // Pending actions, one at a time, in enqueue order.
        let pending = self.queue.list();
        if !pending.is_empty() {
            info!(user_id, pending = pending.len(), "Replaying pending actions");
        }
        for action in &pending {
            if locals.cancelled.contains(&action.id) {
                continue;
            }
            match self.replay(action, &mut locals).await {
                Ok(Replay::Applied { promoted }) => {
                    self.queue.remove(&action.id);
                    result.synced_count += 1;
                    if let Some((local_id, server_id)) = promoted {
                        result.id_mappings.insert(local_id, server_id);
                    }
                }
                Ok(Replay::Deferred(reason)) => {
                    debug!(action_id = %action.id, reason, "Pending action deferred");
                }
                Err(e) => {
                    result.failed_count += 1;
                    let message = e.to_string();
                    if self.settings.dead_letter_permanent_failures && e.is_permanent() {
                        self.queue.dead_letter(&action.id, &message);
                        result.dead_lettered += 1;
                    } else {
                        warn!(
                            action_id = %action.id,
                            action_type = %action.action_type,
                            error = %message,
                            "Pending action replay failed; keeping it queued"
                        );
                        self.queue.record_failure(&action.id, &message);
                    }
                }
            }
        }

        // Interventions that so far only exist on this device.
        for record in local_records.iter().filter(|r| r.is_local()) {
            if locals.is_settled(&record.id) {
                continue;
            }
            match self.push_local_record(record).await {
                Ok(server_id) => {
                    info!(local_id = %record.id, server_id = %server_id, "Local intervention created remotely");
                    self.cache.save_id_mapping(&record.id, &server_id);
                    locals.mappings.insert(record.id.clone(), server_id.clone());
                    result.id_mappings.insert(record.id.clone(), server_id);
                    result.pushed_count += 1;
                }
                Err(e) => {
                    result.failed_count += 1;
                    warn!(local_id = %record.id, error = %e, "Failed to push local intervention");
                }
            }
        }

        // Authoritative server state.
        match self.refresh_cache(user_id, local_records, &locals).await {
            Ok(confirmed) => {
                let now = Utc::now();
                let mut marker = Map::new();
                marker.insert("lastSync".into(), timestamp_value(now));
                if let Err(e) = self.remote.update(USERS_COLLECTION, user_id, marker).await {
                    warn!(user_id, error = %e, "Failed to record last sync on server");
                }
                self.cache.set_last_sync(user_id, now);
                self.prune_id_mappings(local_records, &confirmed, &locals.deleted);
                result.success = true;
            }
            Err(e) => {
                warn!(user_id, error = %e, "Sync cycle failed while fetching server state");
                result.success = false;
                result.error = Some(e.to_string());
            }
        }

        self.record_run(user_id, started_at, &result);
        if result.synced_count > 0 || result.pushed_count > 0 || result.failed_count > 0 {
            info!(
                user_id,
                synced = result.synced_count,
                pushed = result.pushed_count,
                failed = result.failed_count,
                "Sync cycle complete"
            );
        }
        result
    }

    /// Forget a local-to-server mapping once no queued action names the
    /// local id, the caller no longer holds a record under it, and the server
    /// copy either came back in `confirmed` or was deleted this cycle.
    fn prune_id_mappings(
        &self,
        local_records: &[Intervention],
        confirmed: &HashSet<String>,
        deleted: &HashSet<String>,
    ) {
        let mut in_use: HashSet<String> = self.queue.referenced_record_ids().into_iter().collect();
        in_use.extend(local_records.iter().map(|r| r.id.clone()));
        let dropped = self.cache.retain_id_mappings(|local, server| {
            in_use.contains(local) || !(confirmed.contains(server) || deleted.contains(local))
        });
        if dropped > 0 {
            debug!(dropped, "Pruned settled id mappings");
        }
    }

    fn record_run(&self, user_id: &str, started_at: DateTime<Utc>, result: &SyncResult) {
        let Some(db) = &self.history else {
            return;
        };
        let run = SyncRun {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            started_at: started_at.to_rfc3339(),
            finished_at: Some(Utc::now().to_rfc3339()),
            synced_count: result.synced_count as i64,
            failed_count: result.failed_count as i64,
            success: result.success,
            error: result.error.clone(),
        };
        match db.conn.lock() {
            Ok(conn) => {
                if let Err(e) = db::record_sync_run(&conn, &run) {
                    warn!("Failed to record sync run: {e}");
                }
            }
            Err(e) => warn!("Failed to record sync run: {e}"),
        }
    }

    /// Resolve an intervention id for a remote call. `None` means the record
    /// only exists locally and has no server id yet.
    fn resolve_target(&self, id: &str, locals: &LocalIds) -> Option<String> {
        if is_local_id(id) {
            locals.mappings.get(id).cloned()
        } else {
            Some(id.to_string())
        }
    }

    async fn replay(&self, action: &PendingAction, locals: &mut LocalIds) -> Result<Replay, ReplayError> {
        match action.action_type {
            ActionType::AddIntervention => {
                let record: Intervention = parse_payload(action)?;
                if record.is_local() && locals.mappings.contains_key(&record.id) {
                    // Already pushed by an earlier cycle.
                    return Ok(Replay::Applied { promoted: None });
                }
                if locals.deleted.contains(&record.id) {
                    return Ok(Replay::Applied { promoted: None });
                }
                let server_id = self.push_local_record(&record).await?;
                if record.is_local() {
                    self.cache.save_id_mapping(&record.id, &server_id);
                    locals.mappings.insert(record.id.clone(), server_id.clone());
                    return Ok(Replay::Applied {
                        promoted: Some((record.id, server_id)),
                    });
                }
                Ok(Replay::Applied { promoted: None })
            }
            ActionType::UpdateIntervention => {
                let mut payload: UpdateInterventionPayload = parse_payload(action)?;
                if locals.deleted.contains(&payload.id) {
                    return Ok(Replay::Applied { promoted: None });
                }
                let Some(target) = self.resolve_target(&payload.id, locals) else {
                    return Ok(Replay::Deferred("intervention not created remotely yet"));
                };
                if target != payload.id {
                    // Persist the server id so a retry never carries the local one.
                    payload.id = target.clone();
                    if let Ok(rewritten) = serde_json::to_value(&payload) {
                        self.queue.replace_payload(&action.id, rewritten);
                    }
                }
                let mut changes = payload.changes;
                changes.remove("id");
                changes
                    .entry("updatedAt")
                    .or_insert_with(|| timestamp_value(Utc::now()));
                self.remote
                    .update(INTERVENTIONS_COLLECTION, &target, changes)
                    .await?;
                Ok(Replay::Applied { promoted: None })
            }
            ActionType::DeleteIntervention => {
                let payload: DeleteInterventionPayload = parse_payload(action)?;
                match self.resolve_target(&payload.id, locals) {
                    Some(target) => {
                        self.remote
                            .delete(INTERVENTIONS_COLLECTION, &target)
                            .await?;
                        if is_local_id(&payload.id) {
                            locals.deleted.insert(payload.id);
                        }
                    }
                    None => {
                        debug!(local_id = %payload.id, "Dropping delete of never-synced intervention");
                        // A create that failed earlier must not resurrect the record.
                        locals
                            .cancelled
                            .extend(self.queue.cancel_record_writes(&payload.id));
                        locals.deleted.insert(payload.id);
                    }
                }
                Ok(Replay::Applied { promoted: None })
            }
            ActionType::ToggleRoomBlock => {
                let payload: ToggleRoomBlockPayload = parse_payload(action)?;
                apply_room_block(self.remote.as_ref(), &payload).await?;
                Ok(Replay::Applied { promoted: None })
            }
        }
    }

    async fn push_local_record(&self, record: &Intervention) -> Result<String, RemoteError> {
        self.remote
            .create(INTERVENTIONS_COLLECTION, creation_data(record))
            .await
    }

    /// Replace the cached snapshots with the server's view, keeping
    /// local-only interventions that have not been confirmed and local edits
    /// newer than the server copy while their update is still queued.
    /// Returns the ids of the interventions the server sent.
    async fn refresh_cache(
        &self,
        user_id: &str,
        local_records: &[Intervention],
        locals: &LocalIds,
    ) -> Result<HashSet<String>, RemoteError> {
        let intervention_docs = self
            .remote
            .query(
                INTERVENTIONS_COLLECTION,
                &[QueryFilter::eq("assignedTo", user_id)],
                Some(&OrderBy::desc("createdAt")),
            )
            .await?;
        let room_docs = self
            .remote
            .query(
                BLOCKED_ROOMS_COLLECTION,
                &[QueryFilter::eq("active", true)],
                None,
            )
            .await?;

        let server: Vec<Intervention> = parse_documents(intervention_docs);
        let rooms: Vec<BlockedRoom> = parse_documents(room_docs);

        let unconfirmed_updates: HashSet<String> = self
            .queue
            .list()
            .into_iter()
            .filter(|a| a.action_type == ActionType::UpdateIntervention)
            .filter_map(|a| serde_json::from_value::<UpdateInterventionPayload>(a.payload).ok())
            .map(|p| p.id)
            .collect();
        let local_by_id: HashMap<&str, &Intervention> =
            local_records.iter().map(|r| (r.id.as_str(), r)).collect();

        let confirmed: HashSet<String> = server.iter().map(|r| r.id.clone()).collect();
        let merged_server: Vec<Intervention> = server
            .into_iter()
            .map(|server_copy| {
                match local_by_id.get(server_copy.id.as_str()) {
                    Some(local) if unconfirmed_updates.contains(&server_copy.id) => {
                        resolve_conflicts((*local).clone(), server_copy)
                    }
                    _ => server_copy,
                }
            })
            .collect();
        let still_local: Vec<Intervention> = local_records
            .iter()
            .filter(|r| r.is_local() && !locals.is_settled(&r.id))
            .cloned()
            .collect();
        if !still_local.is_empty() {
            debug!(count = still_local.len(), "Keeping unconfirmed local interventions in cache");
        }
        let mut merged = still_local;
        merged.extend(merged_server);

        self.cache.save_interventions(&merged);
        self.cache.save_blocked_rooms(&rooms);
        Ok(confirmed)
    }

    /// Apply a list of raw writes as one atomic remote batch.
    ///
    /// Operations with an unrecognized type (or missing the id/data their
    /// type needs) are skipped with a warning; the rest are committed
    /// together. Returns the number of writes committed.
    pub async fn batch_sync(&self, operations: Vec<BatchOperation>) -> Result<usize, RemoteError> {
        let mut writes = Vec::with_capacity(operations.len());
        for op in operations {
            let write = match (op.op_type.as_str(), op.id, op.data) {
                ("set", Some(id), Some(data)) => WriteOp::Set {
                    collection: op.collection,
                    id,
                    data,
                },
                ("update", Some(id), Some(data)) => WriteOp::Update {
                    collection: op.collection,
                    id,
                    data,
                },
                ("delete", Some(id), _) => WriteOp::Delete {
                    collection: op.collection,
                    id,
                },
                ("set" | "update" | "delete", _, _) => {
                    warn!(op_type = %op.op_type, collection = %op.collection, "Skipping incomplete batch operation");
                    continue;
                }
                (other, _, _) => {
                    warn!(op_type = other, collection = %op.collection, "Skipping unknown batch operation type");
                    continue;
                }
            };
            writes.push(write);
        }

        if writes.is_empty() {
            return Ok(0);
        }
        let count = writes.len();
        self.remote.batch_commit(writes).await?;
        info!(count, "Batch sync committed");
        Ok(count)
    }

    pub fn sync_status(&self, user_id: &str) -> SyncStatus {
        let last_run = self.history.as_ref().and_then(|db| {
            let conn = db.conn.lock().ok()?;
            db::last_sync_run(&conn, user_id)
                .map_err(|e| warn!("Failed to read sync history: {e}"))
                .ok()
                .flatten()
        });
        SyncStatus {
            pending_count: self.queue.len(),
            dead_letter_count: self.queue.dead_letters().len(),
            last_sync: self.cache.last_sync(user_id),
            needs_sync: self.needs_sync(user_id),
            is_syncing: self.lock_gate().running,
            last_run,
        }
    }
}

fn parse_documents<T: serde::de::DeserializeOwned>(docs: Vec<Document>) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| {
            let id = doc.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
            match serde_json::from_value(Value::Object(doc)) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(doc_id = %id, error = %e, "Skipping unreadable server document");
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Spawn the background sync loop for `user_id`.
///
/// Every `interval` it probes the remote store. While unreachable the queue
/// is left untouched. When the store comes back, or when `needs_sync` says
/// a cycle is due, it runs `sync_all` with the cached interventions as the
/// local view. Cancel `cancel` to stop the loop.
pub fn start_sync_loop(
    service: Arc<SyncService>,
    user_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", interval.as_secs_f32());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Sync loop stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let online = service.remote().is_reachable().await;
            if !online {
                if previous_online != Some(false) {
                    info!("Document store unreachable; deferring sync and keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }

            let reconnected = previous_online == Some(false);
            if reconnected {
                info!("Document store reachable again; resuming queued sync");
            }
            previous_online = Some(true);

            if !reconnected && !service.needs_sync(&user_id) {
                continue;
            }

            let local_records = service.cache().interventions();
            let result = service.sync_all(&user_id, &local_records).await;
            if !result.success {
                warn!(
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Sync cycle failed"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::MemoryKeyValueStore;
    use crate::remote::MemoryRemoteStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Harness {
        remote: Arc<MemoryRemoteStore>,
        service: SyncService,
    }

    fn harness_with(settings: SyncSettings) -> Harness {
        let store = Arc::new(MemoryKeyValueStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.insert(USERS_COLLECTION, "tech-1", json!({ "name": "Tech" }));
        let service = SyncService::new(
            remote.clone(),
            Arc::new(PendingActionQueue::load(store.clone())),
            Arc::new(OfflineCache::new(store)),
            settings,
        );
        Harness { remote, service }
    }

    fn harness() -> Harness {
        harness_with(SyncSettings::default())
    }

    fn intervention(id: &str, title: &str) -> Intervention {
        serde_json::from_value(json!({
            "id": id,
            "title": title,
            "status": "nouvelle",
            "assignedTo": "tech-1"
        }))
        .unwrap()
    }

    fn add(h: &Harness, id: &str, title: &str) -> PendingAction {
        h.service.queue().enqueue(
            ActionType::AddIntervention,
            serde_json::to_value(intervention(id, title)).unwrap(),
        )
    }

    fn stamped(id: &str, updated_at: &str, title: &str) -> Intervention {
        serde_json::from_value(json!({ "id": id, "title": title, "updatedAt": updated_at }))
            .unwrap()
    }

    // -- conflict resolution ------------------------------------------------

    #[test]
    fn test_resolve_conflicts_newer_updated_at_wins_whole_record() {
        let local = stamped("a", "2026-02-01T10:00:00Z", "local title");
        let server = stamped("a", "2026-02-01T09:00:00Z", "server title");
        let winner = resolve_conflicts(local.clone(), server.clone());
        assert_eq!(winner, local);

        let winner = resolve_conflicts(server.clone(), local.clone());
        assert_eq!(winner.title, "local title");
    }

    #[test]
    fn test_resolve_conflicts_falls_back_to_created_at_and_ties_go_to_server() {
        let local: Intervention = serde_json::from_value(json!({
            "id": "a", "title": "local", "createdAt": "2026-02-02T00:00:00Z"
        }))
        .unwrap();
        let server = stamped("a", "2026-02-01T00:00:00Z", "server");
        assert_eq!(resolve_conflicts(local.clone(), server).title, "local");

        let tie_local = stamped("a", "2026-02-01T00:00:00Z", "local");
        let tie_server = stamped("a", "2026-02-01T00:00:00Z", "server");
        assert_eq!(resolve_conflicts(tie_local, tie_server).title, "server");

        let bare_local = intervention("a", "local");
        let bare_server = intervention("a", "server");
        assert_eq!(resolve_conflicts(bare_local, bare_server).title, "server");
    }

    // -- needs_sync -----------------------------------------------------------

    #[test]
    fn test_needs_sync_when_queue_non_empty_even_if_fresh() {
        let h = harness();
        h.service.cache().set_last_sync("tech-1", Utc::now());
        assert!(!h.service.needs_sync("tech-1"));

        add(&h, "local_1", "Fuite");
        assert!(h.service.needs_sync("tech-1"));
    }

    #[test]
    fn test_needs_sync_without_timestamp_and_when_stale() {
        let h = harness();
        assert!(h.service.needs_sync("tech-1"));

        h.service
            .cache()
            .set_last_sync("tech-1", Utc::now() - chrono::Duration::minutes(61));
        assert!(h.service.needs_sync("tech-1"));

        h.service
            .cache()
            .set_last_sync("tech-1", Utc::now() - chrono::Duration::minutes(59));
        assert!(!h.service.needs_sync("tech-1"));
    }

    // -- sync_all -------------------------------------------------------------

    #[tokio::test]
    async fn test_failed_action_stays_queued_while_others_sync() {
        let h = harness();
        h.remote.fail_when(
            "title",
            json!("B"),
            RemoteError::Unavailable("simulated".into()),
        );
        add(&h, "local_1", "A");
        let b = add(&h, "local_2", "B");
        add(&h, "local_3", "C");

        let result = h.service.sync_all("tech-1", &[]).await;
        assert!(result.success);
        assert_eq!(result.synced_count, 2);
        assert_eq!(result.failed_count, 1);

        let remaining = h.service.queue().list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);
        assert_eq!(remaining[0].attempts, 1);
        assert_eq!(h.remote.documents(INTERVENTIONS_COLLECTION).len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_rejection_retried_forever_by_default() {
        let h = harness();
        h.remote.fail_collection(
            INTERVENTIONS_COLLECTION,
            RemoteError::PermissionDenied("rules".into()),
        );
        add(&h, "local_1", "A");

        for _ in 0..3 {
            h.service.sync_all("tech-1", &[]).await;
        }
        let queued = h.service.queue().list();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 3);
        assert!(h.service.queue().dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_rejection_dead_lettered_when_enabled() {
        let h = harness_with(SyncSettings {
            dead_letter_permanent_failures: true,
            ..SyncSettings::default()
        });
        h.remote.fail_when(
            "title",
            json!("Interdit"),
            RemoteError::PermissionDenied("rules".into()),
        );
        h.remote.fail_when(
            "title",
            json!("Plus tard"),
            RemoteError::Unavailable("flaky".into()),
        );
        add(&h, "local_1", "Interdit");
        let transient = add(&h, "local_2", "Plus tard");

        let result = h.service.sync_all("tech-1", &[]).await;
        assert_eq!(result.dead_lettered, 1);
        assert_eq!(result.failed_count, 2);

        let queued = h.service.queue().list();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, transient.id);
        let dead = h.service.queue().dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("permission-denied"));
    }

    #[tokio::test]
    async fn test_only_local_prefixed_records_are_pushed() {
        let h = harness();
        let local = intervention("local_1700000000000", "Prise HS");
        let server = intervention("abc123", "Clim");

        let result = h.service.sync_all("tech-1", &[local, server]).await;
        assert!(result.success);
        assert_eq!(result.pushed_count, 1);
        assert_eq!(h.remote.create_calls(), 1);

        let server_id = result.id_mappings["local_1700000000000"].clone();
        assert!(!server_id.starts_with("local_"));
        let doc = h.remote.get(INTERVENTIONS_COLLECTION, &server_id).unwrap();
        assert_eq!(doc["title"], "Prise HS");
        assert!(doc.get("id").is_none());
        assert!(h
            .remote
            .documents(INTERVENTIONS_COLLECTION)
            .iter()
            .all(|d| !d["id"].as_str().unwrap().starts_with("local_")));
    }

    #[tokio::test]
    async fn test_pushed_local_record_is_not_pushed_twice() {
        let h = harness();
        let local = intervention("local_1", "Prise HS");

        h.service.sync_all("tech-1", &[local.clone()]).await;
        let second = h.service.sync_all("tech-1", &[local]).await;
        assert_eq!(second.pushed_count, 0);
        assert_eq!(h.remote.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_update_of_local_record_is_replayed_against_server_id() {
        let h = harness();
        add(&h, "local_1", "Fuite");
        let update = h.service.queue().enqueue(
            ActionType::UpdateIntervention,
            json!({ "id": "local_1", "changes": { "status": "terminee" } }),
        );

        let result = h.service.sync_all("tech-1", &[]).await;
        assert_eq!(result.synced_count, 2);
        assert!(!h.service.queue().list().iter().any(|a| a.id == update.id));

        let server_id = &result.id_mappings["local_1"];
        let doc = h.remote.get(INTERVENTIONS_COLLECTION, server_id).unwrap();
        assert_eq!(doc["status"], "terminee");
        assert!(doc.contains_key("updatedAt"));
    }

    #[tokio::test]
    async fn test_update_of_unknown_local_record_is_deferred_then_applied() {
        let h = harness();
        let update = h.service.queue().enqueue(
            ActionType::UpdateIntervention,
            json!({ "id": "local_9", "changes": { "status": "en cours" } }),
        );

        // Not created yet anywhere: waits without counting as a failure.
        let first = h.service.sync_all("tech-1", &[]).await;
        assert_eq!(first.failed_count, 0);
        assert_eq!(h.service.queue().list()[0].id, update.id);

        // The UI still holds the record: it is pushed this cycle, and the
        // queued update follows on the next one.
        let record = intervention("local_9", "Porte");
        h.service.sync_all("tech-1", &[record.clone()]).await;
        let third = h.service.sync_all("tech-1", &[record]).await;
        assert_eq!(third.synced_count, 1);
        assert!(h.service.queue().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_never_synced_record_skips_remote_and_push() {
        let h = harness();
        add(&h, "local_5", "Erreur de saisie");
        h.remote.set_offline(true);
        h.service.sync_all("tech-1", &[]).await;
        h.remote.set_offline(false);

        // Add failed while offline; delete queued afterwards.
        h.service.queue().clear();
        h.service.queue().enqueue(
            ActionType::DeleteIntervention,
            json!({ "id": "local_5" }),
        );
        let record = intervention("local_5", "Erreur de saisie");
        let result = h.service.sync_all("tech-1", &[record]).await;

        assert_eq!(result.synced_count, 1);
        assert_eq!(result.pushed_count, 0);
        assert_eq!(h.remote.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_of_local_record_cancels_its_failed_create() {
        let h = harness();
        add(&h, "local_5", "Erreur de saisie");
        h.service.queue().enqueue(
            ActionType::UpdateIntervention,
            json!({ "id": "local_5", "changes": { "status": "en cours" } }),
        );
        h.service.queue().enqueue(
            ActionType::DeleteIntervention,
            json!({ "id": "local_5" }),
        );
        h.remote.fail_when(
            "title",
            json!("Erreur de saisie"),
            RemoteError::Unavailable("Failed to get document because the client is offline.".into()),
        );

        let first = h.service.sync_all("tech-1", &[]).await;
        assert_eq!(first.failed_count, 1);
        assert_eq!(first.synced_count, 1);
        assert!(h.service.queue().is_empty());

        h.remote.clear_failures();
        let second = h.service.sync_all("tech-1", &[]).await;
        assert!(second.success);
        assert_eq!(second.synced_count, 0);
        assert_eq!(h.remote.create_calls(), 0);
        assert!(h.remote.documents(INTERVENTIONS_COLLECTION).is_empty());
    }

    // -- id mappings ----------------------------------------------------------

    #[tokio::test]
    async fn test_settled_id_mapping_is_pruned_once_unreferenced() {
        let h = harness();
        let local = intervention("local_1", "Prise HS");

        h.service.sync_all("tech-1", &[local.clone()]).await;
        assert!(h.service.cache().id_mappings().contains_key("local_1"));

        // The refreshed cache holds the server copy only.
        let cached = h.service.cache().interventions();
        assert!(cached.iter().all(|r| r.id != "local_1"));
        let result = h.service.sync_all("tech-1", &cached).await;

        assert!(result.success);
        assert_eq!(result.pushed_count, 0);
        assert!(h.service.cache().id_mappings().is_empty());
        assert_eq!(h.remote.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_id_mapping_kept_while_a_queued_delete_names_the_local_id() {
        let h = harness();
        h.service
            .sync_all("tech-1", &[intervention("local_1", "Fuite")])
            .await;
        let server_id = h.service.cache().id_mappings()["local_1"].clone();
        h.service.queue().enqueue(
            ActionType::DeleteIntervention,
            json!({ "id": "local_1" }),
        );
        h.remote.fail_when(
            "title",
            json!("Fuite"),
            RemoteError::Unavailable("Failed to get document because the client is offline.".into()),
        );

        let blocked = h.service.sync_all("tech-1", &[]).await;
        assert!(blocked.success);
        assert_eq!(blocked.failed_count, 1);
        assert_eq!(h.service.cache().id_mappings()["local_1"], server_id);

        h.remote.clear_failures();
        let applied = h.service.sync_all("tech-1", &[]).await;
        assert_eq!(applied.synced_count, 1);
        assert!(h.remote.get(INTERVENTIONS_COLLECTION, &server_id).is_none());
        assert!(h.service.cache().id_mappings().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_toggle_room_block_replay() {
        let h = harness();
        h.remote.insert(
            INTERVENTIONS_COLLECTION,
            "srv-1",
            json!({ "title": "Ancienne", "assignedTo": "tech-1" }),
        );
        h.service.queue().enqueue(
            ActionType::DeleteIntervention,
            json!({ "id": "srv-1" }),
        );
        h.service.queue().enqueue(
            ActionType::ToggleRoomBlock,
            json!({ "roomNumber": "204", "blocked": true, "reason": "Dégât des eaux", "userId": "tech-1" }),
        );

        let result = h.service.sync_all("tech-1", &[]).await;
        assert_eq!(result.synced_count, 2);
        assert!(h.remote.get(INTERVENTIONS_COLLECTION, "srv-1").is_none());
        let rooms = h.service.cache().blocked_rooms();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].room_number, "204");
        assert!(rooms[0].active);

        h.service.queue().enqueue(
            ActionType::ToggleRoomBlock,
            json!({ "roomNumber": "204", "blocked": false, "userId": "tech-1" }),
        );
        h.service.sync_all("tech-1", &[]).await;
        assert!(h.service.cache().blocked_rooms().is_empty());
        let released = h.remote.documents(BLOCKED_ROOMS_COLLECTION);
        assert_eq!(released[0]["active"], false);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_permanent_failure() {
        let h = harness_with(SyncSettings {
            dead_letter_permanent_failures: true,
            ..SyncSettings::default()
        });
        h.service
            .queue()
            .enqueue(ActionType::DeleteIntervention, json!({ "nope": 1 }));
        let result = h.service.sync_all("tech-1", &[]).await;
        assert_eq!(result.dead_lettered, 1);
        assert!(h.service.queue().dead_letters()[0]
            .error
            .contains("malformed DeleteIntervention payload"));
    }

    #[tokio::test]
    async fn test_cache_refreshed_with_server_state_and_unconfirmed_locals() {
        let h = harness();
        h.remote.insert(
            INTERVENTIONS_COLLECTION,
            "srv-1",
            json!({ "title": "Serveur", "assignedTo": "tech-1", "createdAt": "2026-01-01T00:00:00Z" }),
        );
        h.remote.insert(
            INTERVENTIONS_COLLECTION,
            "srv-2",
            json!({ "title": "Autre tech", "assignedTo": "tech-2" }),
        );
        h.service.cache().save_interventions(&[intervention("stale", "Périmé")]);
        h.remote.fail_when(
            "title",
            json!("Bloquée"),
            RemoteError::Unavailable("flaky".into()),
        );
        let unconfirmed = intervention("local_7", "Bloquée");

        let result = h.service.sync_all("tech-1", &[unconfirmed]).await;
        assert!(result.success);

        let ids: Vec<String> = h
            .service
            .cache()
            .interventions()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["local_7".to_string(), "srv-1".to_string()]);
    }

    #[tokio::test]
    async fn test_queued_local_edit_newer_than_server_survives_refresh() {
        let h = harness();
        h.remote.insert(
            INTERVENTIONS_COLLECTION,
            "srv-1",
            json!({ "title": "Ancien", "assignedTo": "tech-1", "updatedAt": "2026-01-01T00:00:00Z" }),
        );
        h.remote.fail_when(
            "status",
            json!("terminee"),
            RemoteError::Unavailable("flaky".into()),
        );
        h.service.queue().enqueue(
            ActionType::UpdateIntervention,
            json!({ "id": "srv-1", "changes": { "status": "terminee" } }),
        );
        let local: Intervention = serde_json::from_value(json!({
            "id": "srv-1",
            "title": "Ancien",
            "status": "terminee",
            "assignedTo": "tech-1",
            "updatedAt": "2026-01-02T00:00:00Z"
        }))
        .unwrap();

        h.service.sync_all("tech-1", &[local]).await;
        let cached = h.service.cache().interventions();
        assert_eq!(cached[0].status, "terminee");
    }

    #[tokio::test]
    async fn test_last_sync_recorded_locally_and_on_server() {
        let h = harness();
        let result = h.service.sync_all("tech-1", &[]).await;
        assert!(result.success);
        assert!(h.service.cache().last_sync("tech-1").is_some());
        let user = h.remote.get(USERS_COLLECTION, "tech-1").unwrap();
        assert!(user["lastSync"].is_string());
        assert!(!h.service.needs_sync("tech-1"));
    }

    #[tokio::test]
    async fn test_fetch_failure_reports_error_and_keeps_queue() {
        let h = harness();
        add(&h, "local_1", "A");
        h.remote.set_offline(true);

        let result = h.service.sync_all("tech-1", &[]).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("unavailable"));
        assert_eq!(h.service.queue().len(), 1);
        assert!(h.service.cache().last_sync("tech-1").is_none());
    }

    #[tokio::test]
    async fn test_sync_runs_are_recorded_in_history() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let history = Arc::new(db::open_in_memory().unwrap());
        let service = SyncService::new(
            remote,
            Arc::new(PendingActionQueue::load(store.clone())),
            Arc::new(OfflineCache::new(store)),
            SyncSettings::default(),
        )
        .with_history(history);

        service.sync_all("tech-1", &[]).await;
        let status = service.sync_status("tech-1");
        let run = status.last_run.expect("recorded run");
        assert!(run.success);
        assert_eq!(status.pending_count, 0);
        assert!(!status.is_syncing);
        assert!(status.last_sync.is_some());
    }

    // -- batch_sync -----------------------------------------------------------

    #[tokio::test]
    async fn test_batch_sync_skips_unknown_type_and_commits_rest() {
        let h = harness();
        h.remote.insert("dropdowns", "old", json!({ "label": "Plomberie" }));
        let ops: Vec<BatchOperation> = serde_json::from_value(json!([
            { "type": "set", "collection": "dropdowns", "id": "new", "data": { "label": "Électricité" } },
            { "type": "bogus", "collection": "dropdowns", "id": "x", "data": {} },
            { "type": "delete", "collection": "dropdowns", "id": "old" }
        ]))
        .unwrap();

        let committed = h.service.batch_sync(ops).await.unwrap();
        assert_eq!(committed, 2);
        assert_eq!(h.remote.batch_commits(), 1);
        assert!(h.remote.get("dropdowns", "new").is_some());
        assert!(h.remote.get("dropdowns", "old").is_none());
        assert!(h.remote.get("dropdowns", "x").is_none());
    }

    #[tokio::test]
    async fn test_batch_sync_with_nothing_valid_skips_commit() {
        let h = harness();
        let ops = vec![BatchOperation {
            op_type: "merge".into(),
            collection: "dropdowns".into(),
            id: Some("a".into()),
            data: None,
        }];
        assert_eq!(h.service.batch_sync(ops).await.unwrap(), 0);
        assert_eq!(h.remote.batch_commits(), 0);
    }

    // -- coalescing -----------------------------------------------------------

    /// Delegates to a memory store, but parks the first query until released.
    struct GatedStore {
        inner: MemoryRemoteStore,
        hold_next_query: AtomicBool,
        /// Fail the parked query once it is released.
        fail_held_query: bool,
        entered: Notify,
        release: Notify,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for GatedStore {
        async fn create(&self, c: &str, d: Map<String, Value>) -> Result<String, RemoteError> {
            self.inner.create(c, d).await
        }
        async fn update(&self, c: &str, id: &str, d: Map<String, Value>) -> Result<(), RemoteError> {
            self.inner.update(c, id, d).await
        }
        async fn delete(&self, c: &str, id: &str) -> Result<(), RemoteError> {
            self.inner.delete(c, id).await
        }
        async fn query(
            &self,
            c: &str,
            f: &[QueryFilter],
            o: Option<&OrderBy>,
        ) -> Result<Vec<Document>, RemoteError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.hold_next_query.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
                if self.fail_held_query {
                    return Err(RemoteError::Unavailable("connection reset".into()));
                }
            }
            self.inner.query(c, f, o).await
        }
        async fn batch_commit(&self, w: Vec<WriteOp>) -> Result<(), RemoteError> {
            self.inner.batch_commit(w).await
        }
        async fn is_reachable(&self) -> bool {
            true
        }
    }

    fn gated(fail_held_query: bool) -> (Arc<GatedStore>, Arc<SyncService>) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let remote = Arc::new(GatedStore {
            inner: MemoryRemoteStore::new(),
            hold_next_query: AtomicBool::new(true),
            fail_held_query,
            entered: Notify::new(),
            release: Notify::new(),
            queries: AtomicUsize::new(0),
        });
        let service = Arc::new(SyncService::new(
            remote.clone(),
            Arc::new(PendingActionQueue::load(store.clone())),
            Arc::new(OfflineCache::new(store)),
            SyncSettings::default(),
        ));
        (remote, service)
    }

    #[tokio::test]
    async fn test_overlapping_syncs_queue_one_follow_up_per_user() {
        let (remote, service) = gated(false);

        let running = {
            let service = service.clone();
            tokio::spawn(async move { service.sync_all("tech-A", &[]).await })
        };
        remote.entered.notified().await;
        assert!(service.sync_status("tech-A").is_syncing);

        let b = service
            .sync_all("tech-B", &[intervention("local_b1", "Ancienne demande")])
            .await;
        let c = service.sync_all("tech-C", &[]).await;
        let b_again = service
            .sync_all("tech-B", &[intervention("local_b2", "Nouvelle demande")])
            .await;
        assert!(b.coalesced && c.coalesced && b_again.coalesced);

        remote.release.notify_one();
        let a = running.await.unwrap();
        assert!(a.success);
        assert!(!a.coalesced);
        // Other users' cycles are not folded into the caller's result.
        assert_eq!(a.pushed_count, 0);
        assert!(a.id_mappings.is_empty());

        // A plus one follow-up each for B and C, two queries per cycle.
        assert_eq!(remote.queries.load(Ordering::SeqCst), 6);
        assert!(service.cache().last_sync("tech-A").is_some());
        assert!(service.cache().last_sync("tech-B").is_some());
        assert!(service.cache().last_sync("tech-C").is_some());
        // The later request for B replaced the earlier one.
        assert_eq!(remote.inner.create_calls(), 1);
        let mappings = service.cache().id_mappings();
        assert!(mappings.contains_key("local_b2"));
        assert!(!mappings.contains_key("local_b1"));
        assert!(!service.sync_status("tech-A").is_syncing);
    }

    #[tokio::test]
    async fn test_failed_cycle_is_not_masked_by_successful_follow_up() {
        let (remote, service) = gated(true);

        let running = {
            let service = service.clone();
            tokio::spawn(async move { service.sync_all("tech-A", &[]).await })
        };
        remote.entered.notified().await;
        let follow_up = service.sync_all("tech-A", &[]).await;
        assert!(follow_up.coalesced);

        remote.release.notify_one();
        let a = running.await.unwrap();

        assert!(!a.success);
        assert!(a.error.as_deref().unwrap().contains("connection reset"));
        // Failed fetch stops after one query; the follow-up makes two.
        assert_eq!(remote.queries.load(Ordering::SeqCst), 3);
        assert!(service.cache().last_sync("tech-A").is_some());
    }

    // -- loop -----------------------------------------------------------------

    #[tokio::test]
    async fn test_sync_loop_drains_queue_once_store_is_reachable() {
        let h = harness();
        add(&h, "local_1", "A");
        h.remote.set_offline(true);
        let remote = h.remote.clone();
        let service = Arc::new(h.service);
        let cancel = CancellationToken::new();
        let handle = start_sync_loop(
            service.clone(),
            "tech-1".into(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.queue().len(), 1);

        remote.set_offline(false);
        for _ in 0..100 {
            if service.queue().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.queue().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
