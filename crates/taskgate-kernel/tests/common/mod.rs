#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use taskgate_kernel::{Kernel, RetryPolicy, RetryRule, WorkerError, WorkerRegistry};
use taskgate_store::Database;
use taskgate_types::{Receipt, ReceiptFilter};
use uuid::Uuid;

/// Registry with `ghl_event` and `noop` succeeding and `flaky` always failing.
pub fn default_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry
        .register_fn("ghl_event", |payload: &Value| {
            Ok(serde_json::json!({ "handled": payload["event_type"] }))
        })
        .register_fn("noop", |_: &Value| Ok(Value::Null))
        .register_fn("refund", |_: &Value| Ok(Value::Null))
        .register_fn("flaky", |_: &Value| Err(WorkerError::failed("upstream unavailable")));
    registry
}

pub fn kernel_with(registry: WorkerRegistry, max_retries: u32) -> Kernel {
    let db = Arc::new(Database::open_in_memory().expect("in-memory db"));
    Kernel::new(
        db,
        Arc::new(registry),
        RetryPolicy::new(RetryRule::new(max_retries)),
    )
}

pub fn kernel() -> Kernel {
    kernel_with(default_registry(), 3)
}

/// Receipts of one task, oldest first.
pub fn task_receipts(kernel: &Kernel, client_id: &str, task_id: Uuid) -> Vec<Receipt> {
    let mut receipts = kernel
        .get_receipts(
            client_id,
            &ReceiptFilter::default().for_task(task_id).with_limit(100),
        )
        .expect("receipts");
    receipts.reverse();
    receipts
}

/// Whole chain of one client, oldest first.
pub fn chain(kernel: &Kernel, client_id: &str) -> Vec<Receipt> {
    let mut receipts = kernel
        .get_receipts(client_id, &ReceiptFilter::default().with_limit(100))
        .expect("receipts");
    receipts.reverse();
    receipts
}

/// Run `sql` against the receipts table with the append-only trigger removed.
pub fn tamper(db: &Database, sql: &str) {
    db.read(|conn| {
        conn.execute_batch("DROP TRIGGER IF EXISTS receipts_append_only_update;")?;
        conn.execute_batch(sql)?;
        Ok(())
    })
    .expect("tamper");
}
