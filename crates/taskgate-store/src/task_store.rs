//! Task Store – the persisted task queue.
//!
//! Tasks are inserted as `pending` and only ever move along the edges of
//! [`TaskStatus::can_transition_to`].  Every transition is a conditional
//! update guarded by the status the caller last observed:
//!
//! ```sql
//! UPDATE tasks SET status = ?, ... WHERE task_id = ? AND status = <observed>
//! ```
//!
//! so when two dispatchers race for the same row exactly one update changes
//! it and the other gets [`StoreError::Conflict`].  The observed `claimed_at`
//! is part of the guard too, so a claim that was reaped and re-issued cannot
//! be resolved by its original holder.
//!
//! Rows are never deleted.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use taskgate_store::{Database, task_store};
//! use taskgate_types::{NewTask, TaskStatus, now};
//!
//! let db = Database::open_in_memory().unwrap();
//! let created = db
//!     .write(|tx| task_store::insert_task(tx, &NewTask::new("c1", "noop", json!({}), 5)))
//!     .unwrap();
//!
//! let claimed = db
//!     .write(|tx| task_store::claim_next(tx, None, now()))
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(claimed.task_id, created.task_id);
//! assert_eq!(claimed.status, TaskStatus::Claimed);
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};
use taskgate_types::{
    KernelError, NewTask, Task, TaskFilter, TaskStatus, format_timestamp, now, parse_timestamp,
};
use tracing::debug;
use uuid::Uuid;

use crate::database::{Database, StoreError};

const TASK_COLUMNS: &str = "task_id, client_id, task_type, payload, priority, status, \
                            retry_count, created_at, claimed_at, completed_at, available_at";

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| conversion_error(idx, e))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_id: String = row.get(0)?;
    let payload: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(Task {
        task_id: Uuid::parse_str(&task_id).map_err(|e| conversion_error(0, e))?,
        client_id: row.get(1)?,
        task_type: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(3, e))?,
        priority: row.get(4)?,
        status: status.parse().map_err(|e| conversion_error(5, e))?,
        retry_count: row.get(6)?,
        created_at: timestamp_at(row, 7)?,
        claimed_at: optional_timestamp_at(row, 8)?,
        completed_at: optional_timestamp_at(row, 9)?,
        available_at: optional_timestamp_at(row, 10)?,
    })
}

fn format_optional(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(format_timestamp)
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection-level operations
// ─────────────────────────────────────────────────────────────────────────────

/// Validate `new` and insert it as a fresh `pending` task.
///
/// No de-duplication: identical arguments always produce a new `task_id`.
pub fn insert_task(conn: &Connection, new: &NewTask) -> Result<Task, StoreError> {
    new.validate()?;
    let payload = match &new.payload {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    let task = Task {
        task_id: Uuid::new_v4(),
        client_id: new.client_id.clone(),
        task_type: new.task_type.clone(),
        payload,
        priority: new.priority,
        status: TaskStatus::Pending,
        retry_count: 0,
        created_at: now(),
        claimed_at: None,
        completed_at: None,
        available_at: None,
    };

    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL)"
        ),
        params![
            task.task_id.to_string(),
            task.client_id,
            task.task_type,
            serde_json::to_string(&task.payload)?,
            task.priority,
            task.status.as_str(),
            task.retry_count,
            format_timestamp(&task.created_at),
        ],
    )?;
    debug!(
        task_id = %task.task_id,
        client_id = %task.client_id,
        task_type = %task.task_type,
        "task inserted"
    );
    Ok(task)
}

pub fn get_task(conn: &Connection, task_id: Uuid) -> Result<Option<Task>, StoreError> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
            params![task_id.to_string()],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

/// Fetch a task that must belong to `client_id`.
///
/// A task owned by another client is reported exactly like a missing one.
pub fn get_task_for_client(
    conn: &Connection,
    task_id: Uuid,
    client_id: &str,
) -> Result<Task, StoreError> {
    match get_task(conn, task_id)? {
        Some(task) if task.client_id == client_id => Ok(task),
        _ => Err(KernelError::NotFound(format!("task {task_id} for client {client_id}")).into()),
    }
}

/// Tasks for `client_id` matching `filter`, most recently created first.
pub fn list_tasks(
    conn: &Connection,
    client_id: &str,
    filter: &TaskFilter,
) -> Result<Vec<Task>, StoreError> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE client_id = ?");
    let mut args = vec![SqlValue::Text(client_id.to_string())];
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(task_type) = &filter.task_type {
        sql.push_str(" AND task_type = ?");
        args.push(SqlValue::Text(task_type.clone()));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
    args.push(SqlValue::Integer(filter.effective_limit() as i64));

    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params_from_iter(args.iter()), row_to_task)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

/// The task `claim_next` would pick at instant `at`, without claiming it.
///
/// Eligible tasks are `pending` with no `available_at` or one not after `at`,
/// ordered by priority (high first), then creation time, then insertion order.
pub fn next_candidate(
    conn: &Connection,
    client_id: Option<&str>,
    at: DateTime<Utc>,
) -> Result<Option<Task>, StoreError> {
    let mut sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status = 'pending' AND (available_at IS NULL OR available_at <= ?)"
    );
    let mut args = vec![SqlValue::Text(format_timestamp(&at))];
    if let Some(client_id) = client_id {
        sql.push_str(" AND client_id = ?");
        args.push(SqlValue::Text(client_id.to_string()));
    }
    sql.push_str(" ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT 1");

    let task = conn
        .query_row(&sql, params_from_iter(args.iter()), row_to_task)
        .optional()?;
    Ok(task)
}

/// Persist `next` as the successor state of `current`.
///
/// Fails with [`KernelError::InvalidState`] when the status change is not a
/// state-machine edge, and with [`StoreError::Conflict`] when the stored row
/// no longer has `current.status`.
pub fn apply_transition(conn: &Connection, current: &Task, next: &Task) -> Result<(), StoreError> {
    if current.task_id != next.task_id {
        return Err(StoreError::Corrupt(format!(
            "transition from task {} to task {}",
            current.task_id, next.task_id
        )));
    }
    if !current.status.can_transition_to(next.status) {
        return Err(KernelError::InvalidState(format!(
            "task {} cannot move from {} to {}",
            current.task_id, current.status, next.status
        ))
        .into());
    }

    let changed = conn.execute(
        "UPDATE tasks
         SET status = ?1, retry_count = ?2, claimed_at = ?3, completed_at = ?4, available_at = ?5
         WHERE task_id = ?6 AND status = ?7 AND claimed_at IS ?8",
        params![
            next.status.as_str(),
            next.retry_count,
            format_optional(next.claimed_at),
            format_optional(next.completed_at),
            format_optional(next.available_at),
            next.task_id.to_string(),
            current.status.as_str(),
            format_optional(current.claimed_at),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::Conflict(current.task_id));
    }
    debug!(task_id = %next.task_id, from = %current.status, to = %next.status, "task transitioned");
    Ok(())
}

/// Claim the highest-ranked eligible task, if any.
pub fn claim_next(
    conn: &Connection,
    client_id: Option<&str>,
    at: DateTime<Utc>,
) -> Result<Option<Task>, StoreError> {
    let Some(current) = next_candidate(conn, client_id, at)? else {
        return Ok(None);
    };
    let claimed = Task {
        status: TaskStatus::Claimed,
        claimed_at: Some(at),
        available_at: None,
        ..current.clone()
    };
    apply_transition(conn, &current, &claimed)?;
    renew_claim(conn, &claimed, at)?;
    Ok(Some(claimed))
}

/// Refresh the lease on `task`'s claim to `at`.
///
/// Returns `false` when `task` no longer holds the claim (it was resolved or
/// reaped and possibly re-claimed).  `claimed_at` is left untouched so the
/// holder's eventual transition still matches.
pub fn renew_claim(conn: &Connection, task: &Task, at: DateTime<Utc>) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE tasks SET heartbeat_at = ?1
         WHERE task_id = ?2 AND status = 'claimed' AND claimed_at IS ?3",
        params![
            format_timestamp(&at),
            task.task_id.to_string(),
            format_optional(task.claimed_at),
        ],
    )?;
    Ok(changed == 1)
}

pub fn count_pending(conn: &Connection, client_id: &str) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE client_id = ?1 AND status = 'pending'",
        params![client_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Number of tasks in `status` across all clients.
pub fn count_by_status(conn: &Connection, status: TaskStatus) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Last sign of life of a claim: its lease, or the claim itself.
const LEASE: &str = "COALESCE(heartbeat_at, claimed_at)";

/// `claimed` tasks whose lease was last renewed strictly before `cutoff`,
/// oldest first.
pub fn stale_claims(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status = 'claimed' AND {LEASE} < ?1
         ORDER BY {LEASE} ASC"
    ))?;
    let tasks = stmt
        .query_map(params![format_timestamp(&cutoff)], row_to_task)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

/// `task_id` if it is still claimed with a lease older than `cutoff`.
///
/// The reaper re-checks each candidate with this inside its write
/// transaction, so a renewal that lands after [`stale_claims`] wins.
pub fn stale_claim(
    conn: &Connection,
    task_id: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<Option<Task>, StoreError> {
    let task = conn
        .query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE task_id = ?1 AND status = 'claimed' AND {LEASE} < ?2"
            ),
            params![task_id.to_string(), format_timestamp(&cutoff)],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

// ─────────────────────────────────────────────────────────────────────────────
// TaskStore
// ─────────────────────────────────────────────────────────────────────────────

/// Read-side facade over the task table.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Database>,
}

impl TaskStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get_task(&self, task_id: Uuid, client_id: &str) -> Result<Task, StoreError> {
        self.db
            .read(|conn| get_task_for_client(conn, task_id, client_id))
    }

    pub fn get_tasks(&self, client_id: &str, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.db.read(|conn| list_tasks(conn, client_id, filter))
    }

    pub fn count_pending(&self, client_id: &str) -> Result<usize, StoreError> {
        self.db.read(|conn| count_pending(conn, client_id))
    }

    pub fn stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        self.db.read(|conn| stale_claims(conn, cutoff))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn make_store() -> (Arc<Database>, TaskStore) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (db.clone(), TaskStore::new(db))
    }

    fn insert(db: &Database, client_id: &str, task_type: &str, priority: u8) -> Task {
        db.write(|tx| insert_task(tx, &NewTask::new(client_id, task_type, json!({}), priority)))
            .unwrap()
    }

    fn claim(db: &Database, client_id: Option<&str>) -> Option<Task> {
        db.write(|tx| claim_next(tx, client_id, now())).unwrap()
    }

    #[test]
    fn insert_creates_pending_task() {
        let (db, store) = make_store();
        let task = insert(&db, "c1", "ghl_event", 5);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(store.get_task(task.task_id, "c1").unwrap(), task);
    }

    #[test]
    fn identical_inserts_get_distinct_ids() {
        let (db, _store) = make_store();
        let a = insert(&db, "c1", "noop", 5);
        let b = insert(&db, "c1", "noop", 5);
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn null_payload_is_stored_as_empty_object() {
        let (db, _store) = make_store();
        let task = db
            .write(|tx| insert_task(tx, &NewTask::new("c1", "noop", Value::Null, 5)))
            .unwrap();
        assert_eq!(task.payload, json!({}));
    }

    #[test]
    fn invalid_task_is_rejected_before_insert() {
        let (db, store) = make_store();
        let err = db
            .write(|tx| insert_task(tx, &NewTask::new("c1", "", json!({}), 5)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(KernelError::Validation(_))));
        assert!(store.get_tasks("c1", &TaskFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn task_of_another_client_is_not_found() {
        let (db, store) = make_store();
        let task = insert(&db, "c1", "noop", 5);
        let err = store.get_task(task.task_id, "c2").unwrap_err();
        assert!(matches!(err, StoreError::Rejected(KernelError::NotFound(_))));
    }

    #[test]
    fn claim_order_is_priority_then_age() {
        let (db, _store) = make_store();
        let low = insert(&db, "c1", "noop", 1);
        let high_old = insert(&db, "c1", "noop", 9);
        let high_new = insert(&db, "c1", "noop", 9);

        assert_eq!(claim(&db, None).unwrap().task_id, high_old.task_id);
        assert_eq!(claim(&db, None).unwrap().task_id, high_new.task_id);
        assert_eq!(claim(&db, None).unwrap().task_id, low.task_id);
        assert!(claim(&db, None).is_none());
    }

    #[test]
    fn claim_can_be_scoped_to_a_client() {
        let (db, _store) = make_store();
        insert(&db, "c1", "noop", 9);
        let other = insert(&db, "c2", "noop", 1);
        assert_eq!(claim(&db, Some("c2")).unwrap().task_id, other.task_id);
        assert!(claim(&db, Some("c2")).is_none());
    }

    #[test]
    fn backoff_hides_task_until_available() {
        let (db, _store) = make_store();
        let task = insert(&db, "c1", "noop", 5);
        let claimed = claim(&db, None).unwrap();
        let later = now() + Duration::seconds(60);
        let backed_off = Task {
            status: TaskStatus::Pending,
            retry_count: 1,
            claimed_at: None,
            available_at: Some(later),
            ..claimed.clone()
        };
        db.write(|tx| apply_transition(tx, &claimed, &backed_off)).unwrap();

        assert!(claim(&db, None).is_none());
        let eligible = db
            .write(|tx| claim_next(tx, None, later))
            .unwrap()
            .unwrap();
        assert_eq!(eligible.task_id, task.task_id);
        assert!(eligible.available_at.is_none());
    }

    #[test]
    fn stale_snapshot_loses_the_claim() {
        let (db, store) = make_store();
        let task = insert(&db, "c1", "noop", 5);
        let winner = claim(&db, None).unwrap();

        let loser = Task {
            status: TaskStatus::Claimed,
            claimed_at: Some(now()),
            ..task.clone()
        };
        let err = db.write(|tx| apply_transition(tx, &task, &loser)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(id) if id == task.task_id));
        assert_eq!(store.get_task(task.task_id, "c1").unwrap(), winner);
    }

    #[test]
    fn reissued_claim_rejects_previous_holder() {
        let (db, _store) = make_store();
        insert(&db, "c1", "noop", 5);
        let first = claim(&db, None).unwrap();
        let reaped = Task {
            status: TaskStatus::Pending,
            retry_count: 1,
            claimed_at: None,
            ..first.clone()
        };
        db.write(|tx| apply_transition(tx, &first, &reaped)).unwrap();
        let later = now() + Duration::seconds(1);
        let second = db.write(|tx| claim_next(tx, None, later)).unwrap().unwrap();
        assert_ne!(second.claimed_at, first.claimed_at);

        let late_completion = Task {
            status: TaskStatus::Completed,
            completed_at: Some(now()),
            ..first.clone()
        };
        let err = db
            .write(|tx| apply_transition(tx, &first, &late_completion))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let (db, store) = make_store();
        let task = insert(&db, "c1", "noop", 5);
        let completed = Task {
            status: TaskStatus::Completed,
            completed_at: Some(now()),
            ..task.clone()
        };
        let err = db
            .write(|tx| apply_transition(tx, &task, &completed))
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(KernelError::InvalidState(_))));
        assert_eq!(
            store.get_task(task.task_id, "c1").unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let (db, store) = make_store();
        let first = insert(&db, "c1", "noop", 5);
        let second = insert(&db, "c1", "refund", 5);
        insert(&db, "c2", "noop", 5);
        claim(&db, Some("c1"));

        let all = store.get_tasks("c1", &TaskFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].task_id, second.task_id);
        assert_eq!(all[1].task_id, first.task_id);

        let refunds = store
            .get_tasks("c1", &TaskFilter::default().with_task_type("refund"))
            .unwrap();
        assert_eq!(refunds.len(), 1);

        let claimed = store
            .get_tasks("c1", &TaskFilter::default().with_status(TaskStatus::Claimed))
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let limited = store
            .get_tasks("c1", &TaskFilter::default().with_limit(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn pending_count_ignores_other_states_and_clients() {
        let (db, store) = make_store();
        insert(&db, "c1", "noop", 5);
        insert(&db, "c1", "noop", 5);
        insert(&db, "c2", "noop", 5);
        claim(&db, Some("c1"));
        assert_eq!(store.count_pending("c1").unwrap(), 1);
        assert_eq!(store.count_pending("c2").unwrap(), 1);
        let total = db
            .read(|conn| count_by_status(conn, TaskStatus::Pending))
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn stale_claims_respect_cutoff() {
        let (db, store) = make_store();
        insert(&db, "c1", "noop", 5);
        let claimed = claim(&db, None).unwrap();
        assert!(store.stale_claims(now() - Duration::seconds(60)).unwrap().is_empty());
        let stale = store.stale_claims(now() + Duration::seconds(1)).unwrap();
        assert_eq!(stale, vec![claimed]);
    }

    #[test]
    fn renewed_lease_keeps_old_claim_fresh() {
        let (db, store) = make_store();
        insert(&db, "c1", "noop", 5);
        let claimed = db
            .write(|tx| claim_next(tx, None, now() - Duration::minutes(10)))
            .unwrap()
            .unwrap();
        let cutoff = now() - Duration::minutes(5);
        assert_eq!(store.stale_claims(cutoff).unwrap(), vec![claimed.clone()]);

        assert!(db.write(|tx| renew_claim(tx, &claimed, now())).unwrap());
        assert!(store.stale_claims(cutoff).unwrap().is_empty());
        assert!(db.read(|conn| stale_claim(conn, claimed.task_id, cutoff)).unwrap().is_none());

        let stored = db.read(|conn| get_task(conn, claimed.task_id)).unwrap().unwrap();
        assert_eq!(stored.claimed_at, claimed.claimed_at);
    }

    #[test]
    fn former_holder_cannot_renew() {
        let (db, _store) = make_store();
        insert(&db, "c1", "noop", 5);
        let claimed = claim(&db, None).unwrap();
        let released = Task {
            status: TaskStatus::Pending,
            claimed_at: None,
            ..claimed.clone()
        };
        db.write(|tx| apply_transition(tx, &claimed, &released)).unwrap();

        assert!(!db.write(|tx| renew_claim(tx, &claimed, now())).unwrap());
    }

    #[test]
    fn tasks_cannot_be_deleted() {
        let (db, _store) = make_store();
        insert(&db, "c1", "noop", 5);
        let result = db.write(|tx| {
            tx.execute("DELETE FROM tasks", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
    }
}
