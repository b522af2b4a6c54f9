//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode and full fsync on commit so every record write
//! is durable once the call returns. Provides schema migrations, settings
//! helpers, and the shared connection state used by the durable store.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{PosError, PosResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. An unreadable file is NOT deleted: it may
/// hold unsynced orders, so the open error is returned to the caller.
pub fn init(data_dir: &Path) -> PosResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::StorageUnavailable(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("pos.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("Database open failed ({first_err}), retrying once");
            open_and_configure(&db_path).map_err(|e| {
                PosError::StorageUnavailable(format!("Database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a private in-memory database with the full schema.
pub fn open_in_memory() -> PosResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;

    // synchronous = FULL: a put that returned Ok survives power loss.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )
    .map_err(|e| PosError::StorageUnavailable(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| PosError::StorageUnavailable(format!("create schema_version: {e}")))?;

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

/// Migration v1: settings, orders and the outbound sync queue.
///
/// Both record tables share the `(key, doc, ts)` layout used by the durable
/// store. `sync_queue.key` is AUTOINCREMENT so a removed sequence number is
/// never handed out again.
fn migrate_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS orders (
            key TEXT PRIMARY KEY,
            doc TEXT NOT NULL,
            ts INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_queue (
            key INTEGER PRIMARY KEY AUTOINCREMENT,
            doc TEXT NOT NULL,
            ts INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_orders_ts ON orders(ts, key);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_ts ON sync_queue(ts, key);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::StorageUnavailable(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (orders, sync_queue, local_settings)");
    Ok(())
}

/// Migration v2: operations the remote rejected for good, kept for manual
/// reconciliation.
fn migrate_v2(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS sync_rejections (
            key INTEGER PRIMARY KEY,
            doc TEXT NOT NULL,
            ts INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_rejections_ts ON sync_rejections(ts, key);

        INSERT INTO schema_version (version) VALUES (2);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        PosError::StorageUnavailable(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (sync_rejections table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| PosError::StorageUnavailable(format!("set_setting: {e}")))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
