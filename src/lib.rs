//! Offline queue and sync engine for hotel maintenance interventions.
//!
//! Mutations made while the document store is unreachable are recorded in a
//! durable pending-action queue and replayed in order once connectivity
//! returns. [`sync::SyncService`] drives replay, pushes local-only records,
//! refreshes the offline cache and stamps the last-sync time.
//! [`interventions::InterventionService`] is the write path the UI uses.

use std::sync::Arc;
use tracing::info;

pub mod cache;
pub mod config;
pub mod db;
pub mod interventions;
pub mod local_store;
pub mod logging;
pub mod models;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;

pub use cache::OfflineCache;
pub use config::SyncConfig;
pub use interventions::InterventionService;
pub use local_store::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
pub use models::{ActionType, Intervention, MutationResult, PendingAction};
pub use queue::PendingActionQueue;
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteError, RemoteStore};
pub use sync::{resolve_conflicts, start_sync_loop, SyncResult, SyncService, SyncStatus};

/// Everything wired together over one database and one remote store.
pub struct AppState {
    pub db: Arc<db::DbState>,
    pub queue: Arc<PendingActionQueue>,
    pub cache: Arc<OfflineCache>,
    pub sync: Arc<SyncService>,
    pub interventions: Arc<InterventionService>,
}

impl AppState {
    /// Open (or create) the database under `config.data_dir` and build the
    /// services on top of it.
    pub fn open(config: &SyncConfig, remote: Arc<dyn RemoteStore>) -> Result<Self, String> {
        let db = Arc::new(db::init(&config.data_dir)?);
        Ok(Self::with_db(db, config, remote))
    }

    pub fn with_db(db: Arc<db::DbState>, config: &SyncConfig, remote: Arc<dyn RemoteStore>) -> Self {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteKeyValueStore::new(db.clone()));
        let queue = Arc::new(PendingActionQueue::load(store.clone()));
        let cache = Arc::new(OfflineCache::new(store));
        let sync = Arc::new(
            SyncService::new(
                remote.clone(),
                queue.clone(),
                cache.clone(),
                config.sync_settings(),
            )
            .with_history(db.clone()),
        );
        let interventions = Arc::new(InterventionService::new(remote, queue.clone(), cache.clone()));
        info!(pending = queue.len(), "Sync services ready");
        Self {
            db,
            queue,
            cache,
            sync,
            interventions,
        }
    }
}
