//! Local SQLite database layer for the sync node.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection handle used by the repository, spooler and
//! reconciliation job.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::PersistenceError;

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Wrap an already-migrated connection (in-memory databases in tests).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, PersistenceError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PersistenceError::Other(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("sync.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Migrated in-memory database for nodes without durable storage.
pub fn open_in_memory() -> Result<DbState, PersistenceError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    info!("Using in-memory database (schema v{CURRENT_SCHEMA_VERSION})");
    Ok(DbState::from_connection(conn))
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, PersistenceError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub fn run_migrations(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

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
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn apply(conn: &Connection, version: i32, label: &str, sql: &str) -> Result<(), PersistenceError> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        PersistenceError::Sqlite(e)
    })?;
    info!("Applied migration v{version} ({label})");
    Ok(())
}

/// Migration v1: settings, orders, mappings and kitchen orders.
fn migrate_v1(conn: &Connection) -> Result<(), PersistenceError> {
    apply(
        conn,
        1,
        "core tables",
        "
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
            id TEXT PRIMARY KEY,
            order_number TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            data TEXT NOT NULL,
            grand_total REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            accepted_at TEXT,
            ready_at TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS order_mappings (
            external_order_id TEXT PRIMARY KEY,
            order_number TEXT NOT NULL,
            kitchen_order_id TEXT UNIQUE,
            source TEXT NOT NULL,
            current_status TEXT NOT NULL,
            kitchen_status TEXT,
            created_at TEXT NOT NULL,
            accepted_at TEXT,
            ready_at TEXT
        );

        CREATE TABLE IF NOT EXISTS kitchen_orders (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL UNIQUE,
            version INTEGER NOT NULL DEFAULT 1,
            archived INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_kitchen_orders_archived ON kitchen_orders(archived);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
}

/// Migration v2: sync queue and sales ledger.
fn migrate_v2(conn: &Connection) -> Result<(), PersistenceError> {
    apply(
        conn,
        2,
        "sync_queue, sales_transactions",
        "
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        CREATE TABLE IF NOT EXISTS sales_transactions (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL UNIQUE,
            tenant_id TEXT NOT NULL,
            order_number TEXT NOT NULL,
            source TEXT NOT NULL,
            subtotal REAL NOT NULL DEFAULT 0,
            tax REAL NOT NULL DEFAULT 0,
            fees REAL NOT NULL DEFAULT 0,
            discount REAL NOT NULL DEFAULT 0,
            grand_total REAL NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
}

/// Migration v3: kitchen ticket print spool.
fn migrate_v3(conn: &Connection) -> Result<(), PersistenceError> {
    apply(
        conn,
        3,
        "print_jobs",
        "
        CREATE TABLE IF NOT EXISTS print_jobs (
            id TEXT PRIMARY KEY,
            kitchen_order_id TEXT NOT NULL,
            order_number TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'printed', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_print_jobs_status ON print_jobs(status);
        CREATE INDEX IF NOT EXISTS idx_print_jobs_kitchen_order ON print_jobs(kitchen_order_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
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
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), PersistenceError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), PersistenceError> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory migrated database wrapped in a `DbState` (test helper).
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    run_migrations_for_test(&conn);
    DbState::from_connection(conn)
}

// ===========================================================================
// Tests
// ===========================================================================
