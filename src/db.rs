//! Local SQLite database for the sync engine.
//!
//! Uses rusqlite with WAL mode. Holds the key-value table backing the
//! offline queue and cache, plus the history of sync cycles.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared handle to the local database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure, the
/// file is renamed to `sync.db.corrupt-<unix-secs>` and the open retried once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("sync.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), moving it aside and retrying once",
                first_err
            );
            if db_path.exists() {
                let aside = db_path.with_extension(format!(
                    "db.corrupt-{}",
                    chrono::Utc::now().timestamp()
                ));
                if let Err(e) = fs::rename(&db_path, &aside) {
                    warn!("Failed to move {} aside: {e}", db_path.display());
                }
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory database with the full schema applied.
pub fn open_in_memory() -> Result<DbState, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: key-value store for the pending queue and offline cache.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (kv_store table)");
    Ok(())
}

/// Migration v2: sync cycle history.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            synced_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            success INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_runs_user_started
            ON sync_runs(user_id, started_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (sync_runs table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync run history
// ---------------------------------------------------------------------------

/// One row of `sync_runs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: String,
    pub user_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub synced_count: i64,
    pub failed_count: i64,
    pub success: bool,
    pub error: Option<String>,
}

/// Insert a completed sync run.
pub fn record_sync_run(conn: &Connection, run: &SyncRun) -> Result<(), String> {
    conn.execute(
        "INSERT INTO sync_runs (
             id, user_id, started_at, finished_at, synced_count, failed_count, success, error
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            run.id,
            run.user_id,
            run.started_at,
            run.finished_at,
            run.synced_count,
            run.failed_count,
            run.success,
            run.error
        ],
    )
    .map_err(|e| format!("record_sync_run: {e}"))?;
    Ok(())
}

/// Most recent sync run for `user_id`, if any.
pub fn last_sync_run(conn: &Connection, user_id: &str) -> Result<Option<SyncRun>, String> {
    conn.query_row(
        "SELECT id, user_id, started_at, finished_at, synced_count, failed_count, success, error
         FROM sync_runs
         WHERE user_id = ?1
         ORDER BY started_at DESC, rowid DESC
         LIMIT 1",
        params![user_id],
        |row| {
            Ok(SyncRun {
                id: row.get(0)?,
                user_id: row.get(1)?,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                synced_count: row.get(4)?,
                failed_count: row.get(5)?,
                success: row.get(6)?,
                error: row.get(7)?,
            })
        },
    )
    .optional()
    .map_err(|e| format!("last_sync_run: {e}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        assert!(tables.contains(&"kv_store".to_string()), "missing kv_store");
        assert!(tables.contains(&"sync_runs".to_string()), "missing sync_runs");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = init(dir.path()).expect("init");
        let conn = state.conn.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(state.db_path.ends_with("sync.db"));
    }

    #[test]
    fn test_sync_run_roundtrip_returns_latest() {
        let conn = test_db();
        run_migrations(&conn).unwrap();

        let mut run = SyncRun {
            id: "run-1".into(),
            user_id: "tech-1".into(),
            started_at: "2026-01-01T10:00:00Z".into(),
            finished_at: Some("2026-01-01T10:00:02Z".into()),
            synced_count: 3,
            failed_count: 1,
            success: true,
            error: None,
        };
        record_sync_run(&conn, &run).unwrap();

        run.id = "run-2".into();
        run.started_at = "2026-01-01T11:00:00Z".into();
        run.success = false;
        run.error = Some("Service indisponible".into());
        record_sync_run(&conn, &run).unwrap();

        let latest = last_sync_run(&conn, "tech-1").unwrap().expect("a run");
        assert_eq!(latest.id, "run-2");
        assert!(!latest.success);
        assert!(last_sync_run(&conn, "someone-else").unwrap().is_none());
    }
}
