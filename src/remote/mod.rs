//! Boundary to the remote document store.
//!
//! The sync engine only ever talks to the backend through [`RemoteStore`].
//! `http` is the production client; `memory` is a complete in-process
//! store used by tests and offline demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod http;
pub mod memory;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

/// A stored document. Query results always carry the document id under
/// `"id"`.
pub type Document = Map<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed rejection from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("permission-denied: {0}")]
    PermissionDenied(String),
    #[error("not-found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("already-exists: {0}")]
    AlreadyExists(String),
    #[error("invalid-argument: {0}")]
    InvalidArgument(String),
    #[error("resource-exhausted: {0}")]
    ResourceExhausted(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Backend error code, e.g. `permission-denied`.
    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::PermissionDenied(_) => "permission-denied",
            RemoteError::NotFound(_) => "not-found",
            RemoteError::Unavailable(_) => "unavailable",
            RemoteError::AlreadyExists(_) => "already-exists",
            RemoteError::InvalidArgument(_) => "invalid-argument",
            RemoteError::ResourceExhausted(_) => "resource-exhausted",
            RemoteError::Unauthenticated(_) => "unauthenticated",
            RemoteError::Internal(_) => "internal",
        }
    }

    /// Rejections that will fail the same way on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RemoteError::PermissionDenied(_)
                | RemoteError::NotFound(_)
                | RemoteError::AlreadyExists(_)
                | RemoteError::InvalidArgument(_)
        )
    }

    /// Localized message shown to staff.
    pub fn user_message(&self) -> &'static str {
        match self {
            RemoteError::PermissionDenied(_) => {
                "Vous n'avez pas les droits nécessaires pour effectuer cette action."
            }
            RemoteError::NotFound(_) => "L'élément demandé est introuvable.",
            RemoteError::Unavailable(_) => {
                "Service temporairement indisponible. Vérifiez votre connexion."
            }
            _ => "Une erreur est survenue. Veuillez réessayer.",
        }
    }
}

// ---------------------------------------------------------------------------
// Queries and writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "in")]
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl QueryFilter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Desc,
        }
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriteOp {
    /// Create or overwrite the whole document.
    Set {
        collection: String,
        id: String,
        data: Map<String, Value>,
    },
    /// Merge fields into an existing document.
    Update {
        collection: String,
        id: String,
        data: Map<String, Value>,
    },
    Delete { collection: String, id: String },
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document and return the id the store assigned.
    async fn create(&self, collection: &str, data: Map<String, Value>)
        -> Result<String, RemoteError>;

    /// Merge `partial` into an existing document.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: Map<String, Value>,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    async fn query(
        &self,
        collection: &str,
        filters: &[QueryFilter],
        order: Option<&OrderBy>,
    ) -> Result<Vec<Document>, RemoteError>;

    /// Apply every write or none of them.
    async fn batch_commit(&self, writes: Vec<WriteOp>) -> Result<(), RemoteError>;

    /// Cheap connectivity probe.
    async fn is_reachable(&self) -> bool;
}
