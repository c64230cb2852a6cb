//! [`Database`] – the single SQLite handle shared by every store.
//!
//! # Storage layout
//!
//! Three tables are created (if they do not already exist):
//!
//! | table      | key                      | notes                                        |
//! |------------|--------------------------|----------------------------------------------|
//! | `tasks`    | `task_id`                | never deleted; terminal rows kept for audit  |
//! | `receipts` | `seq` (+ unique `receipt_id`) | append-only, enforced by triggers       |
//! | `policies` | (`client_id`, `task_type`) | upserted by administrative calls           |
//!
//! `tasks.heartbeat_at` is the claim lease.  It is internal to the store and
//! not part of [`Task`](taskgate_types::Task); files created before the
//! column existed gain it on open.
//!
//! # Write serialization
//!
//! Every write runs inside a `BEGIN IMMEDIATE` transaction, which takes the
//! SQLite write lock up front.  A receipt append reads the client's last
//! hash, computes the new one and inserts it while that lock is held, so two
//! writers (threads sharing this handle, or separate processes opening the
//! same file) can never fork a chain.  In-process callers additionally queue
//! on the connection mutex.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use taskgate_types::KernelError;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id      TEXT    NOT NULL PRIMARY KEY,
    client_id    TEXT    NOT NULL,
    task_type    TEXT    NOT NULL,
    payload      TEXT    NOT NULL,
    priority     INTEGER NOT NULL,
    status       TEXT    NOT NULL,
    retry_count  INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT    NOT NULL,
    claimed_at   TEXT,
    completed_at TEXT,
    available_at TEXT,
    heartbeat_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_dispatch
    ON tasks (status, priority DESC, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_tasks_client
    ON tasks (client_id, created_at DESC);
CREATE TRIGGER IF NOT EXISTS tasks_never_deleted
    BEFORE DELETE ON tasks
BEGIN
    SELECT RAISE(ABORT, 'tasks are retained for audit');
END;

CREATE TABLE IF NOT EXISTS receipts (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    receipt_id TEXT    NOT NULL UNIQUE,
    client_id  TEXT    NOT NULL,
    task_id    TEXT    REFERENCES tasks (task_id),
    action     TEXT    NOT NULL,
    actor      TEXT    NOT NULL,
    payload    TEXT    NOT NULL,
    prev_hash  TEXT    NOT NULL,
    hash       TEXT    NOT NULL,
    created_at TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_receipts_chain
    ON receipts (client_id, seq);
CREATE INDEX IF NOT EXISTS idx_receipts_task
    ON receipts (task_id);
CREATE TRIGGER IF NOT EXISTS receipts_append_only_update
    BEFORE UPDATE ON receipts
BEGIN
    SELECT RAISE(ABORT, 'receipts are append-only');
END;
CREATE TRIGGER IF NOT EXISTS receipts_append_only_delete
    BEFORE DELETE ON receipts
BEGIN
    SELECT RAISE(ABORT, 'receipts are append-only');
END;

CREATE TABLE IF NOT EXISTS policies (
    client_id  TEXT NOT NULL,
    task_type  TEXT NOT NULL,
    decision   TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (client_id, task_type)
);
";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database connection lock poisoned")]
    Poisoned,
    /// Another writer moved the task first; re-run selection.
    #[error("Task {0} changed concurrently")]
    Conflict(Uuid),
    /// A domain rule rejected the operation.
    #[error(transparent)]
    Rejected(#[from] KernelError),
}

impl From<StoreError> for KernelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(inner) => inner,
            StoreError::Conflict(task_id) => {
                KernelError::ConcurrencyConflict(format!("task {task_id} changed concurrently"))
            }
            other => KernelError::Storage(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Database
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite database holding tasks, receipts and policies.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a persistent database at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::initialize(&conn)?;
        debug!(path = %path.display(), journal_mode = %journal_mode, "opened task database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn initialize(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        let has_lease = conn
            .prepare("SELECT 1 FROM pragma_table_info('tasks') WHERE name = 'heartbeat_at'")?
            .exists([])?;
        if !has_lease {
            conn.execute_batch("ALTER TABLE tasks ADD COLUMN heartbeat_at TEXT;")?;
            debug!("added tasks.heartbeat_at");
        }
        Ok(())
    }

    /// Filesystem location, or `None` for an in-memory database.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run read-only queries against the connection.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise,
    /// so a state change is never persisted without its receipts.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
