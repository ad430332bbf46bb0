use anyhow::{anyhow, Context};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use intervention_sync::{logging, storage, start_sync_loop, AppState, HttpRemoteStore, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::from_env().map_err(|e| anyhow!(e)).context("load configuration")?;
    let _log_guard = logging::init(&config.log_dir, config.log_json)
        .map_err(|e| anyhow!(e))
        .context("initialise logging")?;

    info!(
        "Starting intervention-syncd v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );

    let user_id = config
        .user_id
        .clone()
        .context("INTERVENTION_SYNC_USER_ID is not set")?;
    let credentials = storage::resolve_credentials(config.connection_string.as_deref())
        .context("no document store credentials; set INTERVENTION_SYNC_CONNECTION_STRING or store them in the keyring")?;
    if let Some(raw) = config.connection_string.as_deref() {
        if let Err(e) = storage::save_connection_string(raw) {
            warn!("Could not persist credentials to keyring: {e}");
        }
    }

    let remote = HttpRemoteStore::new(&credentials.base_url, credentials.api_key.clone())
        .context("build document store client")?;
    info!(base_url = remote.base_url(), "Document store client ready");

    let app = AppState::open(&config, Arc::new(remote))
        .map_err(|e| anyhow!(e))
        .context("open local database")?;

    let cancel = CancellationToken::new();
    let handle = start_sync_loop(
        app.sync.clone(),
        user_id.clone(),
        config.sync_interval(),
        cancel.clone(),
    );

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();
    if let Err(e) = handle.await {
        error!("Sync loop ended abnormally: {e}");
    }

    let status = app.sync.sync_status(&user_id);
    info!(
        pending = status.pending_count,
        dead_letters = status.dead_letter_count,
        "intervention-syncd stopped"
    );
    Ok(())
}
