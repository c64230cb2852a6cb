//! Receipt Ledger – append-only, hash-chained audit records.
//!
//! Each `client_id` owns one chain.  A receipt's `hash` is
//!
//! ```text
//! hex(SHA-256(prev_hash ‖ canonical_json({action, actor, created_at, payload, task_id})))
//! ```
//!
//! where `prev_hash` is the `hash` of the client's previous receipt, or
//! [`GENESIS_HASH`] for the first one.  [`verify_chain`] re-walks stored rows
//! and recomputes every link, so any after-the-fact edit to a stored field is
//! detected at the first edited receipt.
//!
//! [`append`] must run inside a [`Database::write`] transaction: reading the
//! last hash and inserting the successor happen under the same write lock.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use taskgate_store::{Database, NewReceipt, ReceiptLedger};
//! use taskgate_types::{Actor, ReceiptAction};
//!
//! let db = Arc::new(Database::open_in_memory().unwrap());
//! let ledger = ReceiptLedger::new(db);
//!
//! ledger
//!     .append(NewReceipt::new("c1", ReceiptAction::SystemEvent, Actor::System))
//!     .unwrap();
//!
//! let report = ledger.verify_chain("c1", 50).unwrap();
//! assert!(report.valid);
//! assert_eq!(report.checked, 1);
//! ```

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use taskgate_types::{
    Actor, ChainVerification, Receipt, ReceiptAction, ReceiptFilter, format_timestamp, now,
    parse_timestamp,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::{Database, StoreError};

/// `prev_hash` of the first receipt in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Upper bound on receipts examined by one [`verify_chain`] call.
pub const MAX_VERIFY_LIMIT: usize = 10_000;

const RECEIPT_COLUMNS: &str =
    "receipt_id, client_id, task_id, action, actor, payload, prev_hash, hash, created_at";

// ─────────────────────────────────────────────────────────────────────────────
// NewReceipt
// ─────────────────────────────────────────────────────────────────────────────

/// Fields supplied by the caller; ids, timestamps and hashes are assigned on
/// append.
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub client_id: String,
    pub task_id: Option<Uuid>,
    pub action: ReceiptAction,
    pub actor: Actor,
    pub payload: Value,
}

impl NewReceipt {
    pub fn new(client_id: impl Into<String>, action: ReceiptAction, actor: Actor) -> Self {
        Self {
            client_id: client_id.into(),
            task_id: None,
            action,
            actor,
            payload: Value::Object(Map::new()),
        }
    }

    pub fn task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hashing
// ─────────────────────────────────────────────────────────────────────────────

/// Serialize `value` with object keys sorted at every depth.
///
/// Output does not depend on map insertion order or on which `serde_json`
/// features are enabled elsewhere in the build.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Chain hash of one receipt given its predecessor's hash.
pub fn compute_hash(
    prev_hash: &str,
    action: &str,
    actor: &str,
    payload: &Value,
    task_id: Option<&str>,
    created_at: &str,
) -> String {
    let record = json!({
        "action": action,
        "actor": actor,
        "created_at": created_at,
        "payload": payload,
        "task_id": task_id,
    });
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_json(&record).as_bytes());
    hex::encode(hasher.finalize())
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

/// A receipt row exactly as stored, before any parsing.
struct StoredReceipt {
    receipt_id: String,
    client_id: String,
    task_id: Option<String>,
    action: String,
    actor: String,
    payload: String,
    prev_hash: String,
    hash: String,
    created_at: String,
}

impl StoredReceipt {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            receipt_id: row.get(0)?,
            client_id: row.get(1)?,
            task_id: row.get(2)?,
            action: row.get(3)?,
            actor: row.get(4)?,
            payload: row.get(5)?,
            prev_hash: row.get(6)?,
            hash: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    /// Recompute this row's hash on top of `prev_hash`.
    ///
    /// A payload that no longer parses can never match, so it yields `None`.
    fn recompute_hash(&self, prev_hash: &str) -> Option<String> {
        let payload: Value = serde_json::from_str(&self.payload).ok()?;
        Some(compute_hash(
            prev_hash,
            &self.action,
            &self.actor,
            &payload,
            self.task_id.as_deref(),
            &self.created_at,
        ))
    }

    fn into_receipt(self) -> Result<Receipt, StoreError> {
        let corrupt =
            |what: &str| StoreError::Corrupt(format!("receipt {}: {what}", self.receipt_id));
        Ok(Receipt {
            receipt_id: Uuid::parse_str(&self.receipt_id).map_err(|_| corrupt("receipt_id"))?,
            task_id: self
                .task_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|_| corrupt("task_id"))?,
            action: self.action.parse().map_err(|_| corrupt("action"))?,
            actor: self.actor.parse().map_err(|_| corrupt("actor"))?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_timestamp(&self.created_at).map_err(|_| corrupt("created_at"))?,
            client_id: self.client_id,
            prev_hash: self.prev_hash,
            hash: self.hash,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection-level operations
// ─────────────────────────────────────────────────────────────────────────────

/// Hash of the most recent receipt for `client_id`, if any.
pub fn last_hash(conn: &Connection, client_id: &str) -> Result<Option<String>, StoreError> {
    let hash = conn
        .query_row(
            "SELECT hash FROM receipts WHERE client_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![client_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash)
}

/// Append `receipt` to its client's chain.
///
/// Call inside [`Database::write`].
pub fn append(conn: &Connection, receipt: NewReceipt) -> Result<Receipt, StoreError> {
    let prev_hash =
        last_hash(conn, &receipt.client_id)?.unwrap_or_else(|| GENESIS_HASH.to_string());
    let receipt_id = Uuid::new_v4();
    let created_at = now();
    let created_raw = format_timestamp(&created_at);
    let task_raw = receipt.task_id.map(|id| id.to_string());
    let actor_raw = receipt.actor.to_string();
    let hash = compute_hash(
        &prev_hash,
        receipt.action.as_str(),
        &actor_raw,
        &receipt.payload,
        task_raw.as_deref(),
        &created_raw,
    );

    conn.execute(
        "INSERT INTO receipts
             (receipt_id, client_id, task_id, action, actor, payload, prev_hash, hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            receipt_id.to_string(),
            receipt.client_id,
            task_raw,
            receipt.action.as_str(),
            actor_raw,
            canonical_json(&receipt.payload),
            prev_hash,
            hash,
            created_raw,
        ],
    )?;
    debug!(
        client_id = %receipt.client_id,
        action = %receipt.action,
        receipt_id = %receipt_id,
        "receipt appended"
    );

    Ok(Receipt {
        receipt_id,
        client_id: receipt.client_id,
        task_id: receipt.task_id,
        action: receipt.action,
        actor: receipt.actor,
        payload: receipt.payload,
        prev_hash,
        hash,
        created_at,
    })
}

/// Receipts for `client_id` matching `filter`, most recent first.
pub fn list_receipts(
    conn: &Connection,
    client_id: &str,
    filter: &ReceiptFilter,
) -> Result<Vec<Receipt>, StoreError> {
    let mut sql = format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE client_id = ?");
    let mut args = vec![SqlValue::Text(client_id.to_string())];
    if let Some(action) = filter.action {
        sql.push_str(" AND action = ?");
        args.push(SqlValue::Text(action.as_str().to_string()));
    }
    if let Some(task_id) = filter.task_id {
        sql.push_str(" AND task_id = ?");
        args.push(SqlValue::Text(task_id.to_string()));
    }
    if let Some(since) = filter.since {
        sql.push_str(" AND created_at >= ?");
        args.push(SqlValue::Text(format_timestamp(&since)));
    }
    sql.push_str(" ORDER BY seq DESC LIMIT ?");
    args.push(SqlValue::Integer(filter.effective_limit() as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), StoredReceipt::from_row)?;
    rows.map(|row| row.map_err(StoreError::from).and_then(StoredReceipt::into_receipt))
        .collect()
}

/// Re-walk the `limit` most recent receipts of `client_id`, oldest first.
///
/// Each receipt must link to its predecessor's stored hash and its own stored
/// hash must equal the recomputed one.  The walk stops at the first receipt
/// failing either check; `checked` is then that receipt's position within the
/// window.  The receipt just before the window, when there is one, anchors
/// the first link.
pub fn verify_chain(
    conn: &Connection,
    client_id: &str,
    limit: usize,
) -> Result<ChainVerification, StoreError> {
    let limit = limit.min(MAX_VERIFY_LIMIT);
    if limit == 0 {
        return Ok(ChainVerification {
            valid: true,
            checked: 0,
            first_mismatch: None,
        });
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE client_id = ?1 ORDER BY seq DESC LIMIT ?2"
    ))?;
    let mut rows = stmt
        .query_map(params![client_id, (limit + 1) as i64], StoredReceipt::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();

    let mut expected_prev = if rows.len() > limit {
        rows.remove(0).hash
    } else {
        GENESIS_HASH.to_string()
    };

    for (index, row) in rows.iter().enumerate() {
        let linked = row.prev_hash == expected_prev;
        let intact =
            linked && row.recompute_hash(&expected_prev).as_deref() == Some(row.hash.as_str());
        if !intact {
            warn!(
                client_id,
                receipt_id = %row.receipt_id,
                index,
                linked,
                "receipt chain mismatch"
            );
            return Ok(ChainVerification {
                valid: false,
                checked: index,
                first_mismatch: Uuid::parse_str(&row.receipt_id).ok(),
            });
        }
        expected_prev = row.hash.clone();
    }

    Ok(ChainVerification {
        valid: true,
        checked: rows.len(),
        first_mismatch: None,
    })
}

/// Every `client_id` that owns at least one receipt.
pub fn client_ids(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT DISTINCT client_id FROM receipts ORDER BY client_id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ─────────────────────────────────────────────────────────────────────────────
// ReceiptLedger
// ─────────────────────────────────────────────────────────────────────────────

/// Standalone facade over the ledger functions.
#[derive(Clone)]
pub struct ReceiptLedger {
    db: Arc<Database>,
}

impl ReceiptLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one receipt in its own transaction.
    pub fn append(&self, receipt: NewReceipt) -> Result<Receipt, StoreError> {
        self.db.write(|tx| append(tx, receipt))
    }

    pub fn get_receipts(
        &self,
        client_id: &str,
        filter: &ReceiptFilter,
    ) -> Result<Vec<Receipt>, StoreError> {
        self.db.read(|conn| list_receipts(conn, client_id, filter))
    }

    pub fn verify_chain(
        &self,
        client_id: &str,
        limit: usize,
    ) -> Result<ChainVerification, StoreError> {
        self.db.read(|conn| verify_chain(conn, client_id, limit))
    }

    pub fn client_ids(&self) -> Result<Vec<String>, StoreError> {
        self.db.read(client_ids)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
