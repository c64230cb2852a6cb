//! Policy Store – per-client approval rules keyed by `task_type`.
//!
//! At most one rule exists per (`client_id`, `task_type`).  Setting a rule is
//! itself an audited event: the first write appends `policy_created`, every
//! later write appends `policy_updated` carrying the previous decision, even
//! when the decision did not change.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::json;
use taskgate_types::{
    Actor, Decision, KernelError, Policy, ReceiptAction, format_timestamp, now, parse_timestamp,
};
use tracing::info;

use crate::database::{Database, StoreError};
use crate::receipt_ledger::{self, NewReceipt};

struct StoredPolicy {
    client_id: String,
    task_type: String,
    decision: String,
    updated_by: String,
    created_at: String,
    updated_at: String,
}

impl StoredPolicy {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            client_id: row.get(0)?,
            task_type: row.get(1)?,
            decision: row.get(2)?,
            updated_by: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_policy(self) -> Result<Policy, StoreError> {
        let key = format!("{}/{}", self.client_id, self.task_type);
        let corrupt = |field: &str| StoreError::Corrupt(format!("policy {key}: {field}"));
        Ok(Policy {
            decision: self.decision.parse().map_err(|_| corrupt("decision"))?,
            updated_by: self.updated_by.parse().map_err(|_| corrupt("updated_by"))?,
            created_at: parse_timestamp(&self.created_at).map_err(|_| corrupt("created_at"))?,
            updated_at: parse_timestamp(&self.updated_at).map_err(|_| corrupt("updated_at"))?,
            client_id: self.client_id,
            task_type: self.task_type,
        })
    }
}

pub fn get_policy(
    conn: &Connection,
    client_id: &str,
    task_type: &str,
) -> Result<Option<Policy>, StoreError> {
    conn.query_row(
        "SELECT client_id, task_type, decision, updated_by, created_at, updated_at
         FROM policies WHERE client_id = ?1 AND task_type = ?2",
        params![client_id, task_type],
        StoredPolicy::from_row,
    )
    .optional()?
    .map(StoredPolicy::into_policy)
    .transpose()
}

/// Insert or replace the rule for (`client_id`, `task_type`) and receipt it.
///
/// Call inside [`Database::write`].
pub fn set_policy(
    conn: &Connection,
    client_id: &str,
    task_type: &str,
    decision: Decision,
    actor: &Actor,
) -> Result<Policy, StoreError> {
    if client_id.trim().is_empty() || task_type.trim().is_empty() {
        return Err(
            KernelError::Validation("policy needs a client_id and a task_type".into()).into(),
        );
    }

    let ts = now();
    let previous = get_policy(conn, client_id, task_type)?;
    let (policy, receipt) = match previous {
        None => {
            conn.execute(
                "INSERT INTO policies
                     (client_id, task_type, decision, updated_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    client_id,
                    task_type,
                    decision.as_str(),
                    actor.to_string(),
                    format_timestamp(&ts)
                ],
            )?;
            let policy = Policy {
                client_id: client_id.to_string(),
                task_type: task_type.to_string(),
                decision,
                updated_by: actor.clone(),
                created_at: ts,
                updated_at: ts,
            };
            let receipt = NewReceipt::new(client_id, ReceiptAction::PolicyCreated, actor.clone())
                .payload(json!({ "task_type": task_type, "decision": decision }));
            (policy, receipt)
        }
        Some(existing) => {
            conn.execute(
                "UPDATE policies SET decision = ?3, updated_by = ?4, updated_at = ?5
                 WHERE client_id = ?1 AND task_type = ?2",
                params![
                    client_id,
                    task_type,
                    decision.as_str(),
                    actor.to_string(),
                    format_timestamp(&ts)
                ],
            )?;
            let receipt = NewReceipt::new(client_id, ReceiptAction::PolicyUpdated, actor.clone())
                .payload(json!({
                    "task_type": task_type,
                    "decision": decision,
                    "previous": existing.decision,
                }));
            let policy = Policy {
                decision,
                updated_by: actor.clone(),
                updated_at: ts,
                ..existing
            };
            (policy, receipt)
        }
    };

    receipt_ledger::append(conn, receipt)?;
    info!(client_id, task_type, decision = %decision, actor = %actor, "policy set");
    Ok(policy)
}

/// All rules of `client_id`, ordered by `task_type`.
pub fn list_policies(conn: &Connection, client_id: &str) -> Result<Vec<Policy>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT client_id, task_type, decision, updated_by, created_at, updated_at
         FROM policies WHERE client_id = ?1 ORDER BY task_type",
    )?;
    let rows = stmt.query_map(params![client_id], StoredPolicy::from_row)?;
    rows.map(|row| row.map_err(StoreError::from).and_then(StoredPolicy::into_policy))
        .collect()
}

/// Standalone facade over the policy table.
#[derive(Clone)]
pub struct PolicyStore {
    db: Arc<Database>,
}

impl PolicyStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, client_id: &str, task_type: &str) -> Result<Option<Policy>, StoreError> {
        self.db.read(|conn| get_policy(conn, client_id, task_type))
    }

    pub fn set(
        &self,
        client_id: &str,
        task_type: &str,
        decision: Decision,
        actor: &Actor,
    ) -> Result<Policy, StoreError> {
        self.db
            .write(|tx| set_policy(tx, client_id, task_type, decision, actor))
    }

    pub fn list(&self, client_id: &str) -> Result<Vec<Policy>, StoreError> {
        self.db.read(|conn| list_policies(conn, client_id))
    }
}
