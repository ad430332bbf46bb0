//! Domain records shared by the queue, cache and sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of ids generated for records created while offline.
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Remote collection names.
pub const INTERVENTIONS_COLLECTION: &str = "interventions";
pub const BLOCKED_ROOMS_COLLECTION: &str = "blockedRooms";
pub const USERS_COLLECTION: &str = "users";

/// Generate a local-origin id (`local_<unix-millis>`).
pub fn generate_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Utc::now().timestamp_millis())
}

/// True when `id` was generated locally and has never been assigned by the
/// remote store.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

// ---------------------------------------------------------------------------
// Pending actions
// ---------------------------------------------------------------------------

/// Kind of mutation recorded in the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    AddIntervention,
    UpdateIntervention,
    DeleteIntervention,
    ToggleRoomBlock,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::AddIntervention => "AddIntervention",
            ActionType::UpdateIntervention => "UpdateIntervention",
            ActionType::DeleteIntervention => "DeleteIntervention",
            ActionType::ToggleRoomBlock => "ToggleRoomBlock",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded mutation awaiting confirmation against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// An action parked after a permanent remote rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub action: PendingAction,
    pub error: String,
    pub dead_at: DateTime<Utc>,
}

/// Payload of `UpdateIntervention`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInterventionPayload {
    pub id: String,
    pub changes: Map<String, Value>,
}

/// Payload of `DeleteIntervention`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteInterventionPayload {
    pub id: String,
}

/// Payload of `ToggleRoomBlock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleRoomBlockPayload {
    pub room_number: String,
    pub blocked: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A maintenance intervention (repair request). Fields the engine does not
/// interpret are carried through `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Intervention {
    pub fn is_local(&self) -> bool {
        is_local_id(&self.id)
    }

    /// Document body for a remote create: every field except the id.
    pub fn to_document_data(&self) -> Map<String, Value> {
        let mut data = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        data.remove("id");
        data
    }

    /// Apply a partial update in place, the way the remote store would.
    pub fn apply_changes(&mut self, changes: &Map<String, Value>) {
        let mut merged = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        for (k, v) in changes {
            merged.insert(k.clone(), v.clone());
        }
        if let Ok(updated) = serde_json::from_value::<Intervention>(Value::Object(merged)) {
            *self = updated;
        }
    }
}

/// Active or released block on a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedRoom {
    pub id: String,
    pub room_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Records with the timestamps used by last-writer-wins resolution.
pub trait Versioned {
    fn updated_at(&self) -> Option<DateTime<Utc>>;
    fn created_at(&self) -> Option<DateTime<Utc>>;

    /// `updatedAt`, falling back to `createdAt`.
    fn version_time(&self) -> Option<DateTime<Utc>> {
        self.updated_at().or_else(|| self.created_at())
    }
}

impl Versioned for Intervention {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

impl Versioned for BlockedRoom {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of a domain mutation, as handed back to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl MutationResult {
    pub fn ok(id: Option<String>) -> Self {
        Self {
            success: true,
            error: None,
            id,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            id: None,
        }
    }
}
