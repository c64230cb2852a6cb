//! [`Kernel`] – the library surface consumed by upstream handlers.
//!
//! Wires the stores, the policy gate, the approval service and the
//! dispatcher around one shared [`Database`].  The kernel is `Send + Sync`;
//! wrap it in an `Arc` to drive a dispatcher pool from several threads.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::{Value, json};
//! use taskgate_kernel::{Kernel, RetryPolicy, WorkerRegistry};
//! use taskgate_store::Database;
//! use taskgate_types::{NewTask, TaskStatus};
//!
//! let mut registry = WorkerRegistry::new();
//! registry.register_fn("noop", |_: &Value| Ok(Value::Null));
//!
//! let db = Arc::new(Database::open_in_memory().unwrap());
//! let kernel = Kernel::new(db, Arc::new(registry), RetryPolicy::default());
//!
//! let task = kernel.create_task(NewTask::new("c1", "noop", json!({}), 5)).unwrap();
//! assert_eq!(task.status, TaskStatus::Pending);
//!
//! kernel.run_next_task().unwrap();
//! assert!(kernel.verify_chain("c1", 50).unwrap().valid);
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use taskgate_store::receipt_ledger::{self, NewReceipt};
use taskgate_store::{Database, PolicyStore, ReceiptLedger, TaskStore, task_store};
use taskgate_types::{
    Actor, ChainVerification, Decision, DispatchOutcome, KernelError, NewTask, Policy, Receipt,
    ReceiptAction, ReceiptFilter, Task, TaskFilter,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::approval::ApprovalService;
use crate::dispatcher::Dispatcher;
use crate::health::HealthMonitor;
use crate::ingest::InboundEvent;
use crate::policy_engine::PolicyEngine;
use crate::retry_policy::RetryPolicy;
use crate::worker_registry::WorkerRegistry;

/// `source` recorded for tasks created through [`Kernel::create_task`].
pub const API_SOURCE: &str = "api";

pub struct Kernel {
    db: Arc<Database>,
    tasks: TaskStore,
    ledger: ReceiptLedger,
    policies: PolicyStore,
    engine: PolicyEngine,
    approvals: ApprovalService,
    dispatcher: Dispatcher,
}

impl Kernel {
    pub fn new(db: Arc<Database>, registry: Arc<WorkerRegistry>, retry: RetryPolicy) -> Self {
        Self {
            tasks: TaskStore::new(db.clone()),
            ledger: ReceiptLedger::new(db.clone()),
            policies: PolicyStore::new(db.clone()),
            engine: PolicyEngine::new(),
            approvals: ApprovalService::new(db.clone()),
            dispatcher: Dispatcher::new(db.clone(), registry, retry),
            db,
        }
    }

    /// Lease renewal period for tasks this kernel executes.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_heartbeat_interval(interval);
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &WorkerRegistry {
        self.dispatcher.registry()
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    /// Insert a task and pass it through the policy gate.
    ///
    /// The insert, its `task_created` and `policy_checked` receipts, and any
    /// gate transition commit together.
    pub fn create_task(&self, new: NewTask) -> Result<Task, KernelError> {
        self.create_with_source(new, API_SOURCE)
    }

    /// Create the task an inbound event maps to.
    pub fn ingest(&self, event: InboundEvent) -> Result<Task, KernelError> {
        let new = event.to_new_task()?;
        self.create_with_source(new, &event.receipt_source())
    }

    #[instrument(skip(self, new), fields(client_id = %new.client_id, task_type = %new.task_type))]
    fn create_with_source(&self, new: NewTask, source: &str) -> Result<Task, KernelError> {
        let task = self.db.write(|tx| {
            let task = task_store::insert_task(tx, &new)?;
            receipt_ledger::append(
                tx,
                NewReceipt::new(&task.client_id, ReceiptAction::TaskCreated, Actor::System)
                    .task(task.task_id)
                    .payload(json!({
                        "task_type": task.task_type,
                        "priority": task.priority,
                        "payload": task.payload,
                        "source": source,
                    })),
            )?;
            self.engine.gate(tx, task)
        })?;
        info!(task_id = %task.task_id, status = %task.status, "task created");
        Ok(task)
    }

    pub fn get_task(&self, task_id: Uuid, client_id: &str) -> Result<Task, KernelError> {
        Ok(self.tasks.get_task(task_id, client_id)?)
    }

    pub fn get_tasks(
        &self,
        client_id: &str,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, KernelError> {
        Ok(self.tasks.get_tasks(client_id, filter)?)
    }

    pub fn count_pending_tasks(&self, client_id: &str) -> Result<usize, KernelError> {
        Ok(self.tasks.count_pending(client_id)?)
    }

    pub fn approve_task(
        &self,
        task_id: Uuid,
        client_id: &str,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Task, KernelError> {
        self.approvals.approve_task(task_id, client_id, actor, reason)
    }

    pub fn cancel_task(
        &self,
        task_id: Uuid,
        client_id: &str,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Task, KernelError> {
        self.approvals.cancel_task(task_id, client_id, actor, reason)
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    pub fn run_next_task(&self) -> Result<DispatchOutcome, KernelError> {
        self.dispatcher.run_next_task()
    }

    pub fn run_next_task_for(&self, client_id: &str) -> Result<DispatchOutcome, KernelError> {
        self.dispatcher.run_next_task_for(Some(client_id))
    }

    pub fn reap_stale_claims(&self, older_than: Duration) -> Result<usize, KernelError> {
        self.dispatcher.reap_stale_claims(older_than)
    }

    // ── Ledger ───────────────────────────────────────────────────────────────

    pub fn get_receipts(
        &self,
        client_id: &str,
        filter: &ReceiptFilter,
    ) -> Result<Vec<Receipt>, KernelError> {
        Ok(self.ledger.get_receipts(client_id, filter)?)
    }

    pub fn verify_chain(
        &self,
        client_id: &str,
        limit: usize,
    ) -> Result<ChainVerification, KernelError> {
        Ok(self.ledger.verify_chain(client_id, limit)?)
    }

    /// Append a `system_event` receipt not tied to any task.
    pub fn record_system_event(
        &self,
        client_id: &str,
        actor: &Actor,
        payload: Value,
    ) -> Result<Receipt, KernelError> {
        if client_id.trim().is_empty() {
            return Err(KernelError::Validation("client_id must not be empty".into()));
        }
        Ok(self.ledger.append(
            NewReceipt::new(client_id, ReceiptAction::SystemEvent, actor.clone()).payload(payload),
        )?)
    }

    // ── Policies ─────────────────────────────────────────────────────────────

    pub fn set_policy(
        &self,
        client_id: &str,
        task_type: &str,
        decision: Decision,
        actor: &Actor,
    ) -> Result<Policy, KernelError> {
        Ok(self.policies.set(client_id, task_type, decision, actor)?)
    }

    pub fn get_policy(
        &self,
        client_id: &str,
        task_type: &str,
    ) -> Result<Option<Policy>, KernelError> {
        Ok(self.policies.get(client_id, task_type)?)
    }

    pub fn list_policies(&self, client_id: &str) -> Result<Vec<Policy>, KernelError> {
        Ok(self.policies.list(client_id)?)
    }

    // ── Health ───────────────────────────────────────────────────────────────

    pub fn health_monitor(&self, verify_limit: usize, stale_after: Duration) -> HealthMonitor {
        HealthMonitor::new(self.db.clone(), verify_limit, stale_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_types::TaskStatus;

    fn make_kernel() -> Kernel {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("ghl_event", |_: &Value| Ok(json!({"handled": true})));
        let db = Arc::new(Database::open_in_memory().unwrap());
        Kernel::new(db, Arc::new(registry), RetryPolicy::default())
    }

    #[test]
    fn create_records_source_and_policy_check() {
        let kernel = make_kernel();
        let task = kernel
            .create_task(NewTask::new("c1", "ghl_event", json!({"event_type": "ContactCreate"}), 5))
            .unwrap();
        let mut receipts = kernel
            .get_receipts("c1", &ReceiptFilter::default().for_task(task.task_id))
            .unwrap();
        receipts.reverse();
        assert_eq!(receipts[0].action, ReceiptAction::TaskCreated);
        assert_eq!(receipts[0].payload["source"], API_SOURCE);
        assert_eq!(receipts[1].action, ReceiptAction::PolicyChecked);
        assert_eq!(receipts[1].payload["decision"], "allow");
    }

    #[test]
    fn invalid_create_writes_nothing() {
        let kernel = make_kernel();
        let err = kernel
            .create_task(NewTask::new("c1", "ghl_event", json!({}), 42))
            .unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));
        assert!(kernel.get_receipts("c1", &ReceiptFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn ingest_creates_event_task() {
        let kernel = make_kernel();
        let task = kernel
            .ingest(InboundEvent {
                client_id: "c1".into(),
                source: "ghl".into(),
                event_type: "ContactCreate".into(),
                data: json!({"id": 1}),
                priority: None,
            })
            .unwrap();
        assert_eq!(task.task_type, "ghl_event");
        let created = kernel
            .get_receipts(
                "c1",
                &ReceiptFilter::default().with_action(ReceiptAction::TaskCreated),
            )
            .unwrap();
        assert_eq!(created[0].payload["source"], "event:ghl");
    }

    #[test]
    fn deny_policy_cancels_on_create() {
        let kernel = make_kernel();
        kernel
            .set_policy("c1", "wire", Decision::Deny, &Actor::user("admin"))
            .unwrap();
        let task = kernel
            .create_task(NewTask::new("c1", "wire", json!({}), 5))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(kernel.run_next_task().unwrap().is_idle());
        assert_eq!(kernel.list_policies("c1").unwrap().len(), 1);
    }

    #[test]
    fn system_event_has_no_task() {
        let kernel = make_kernel();
        let receipt = kernel
            .record_system_event("c1", &Actor::System, json!({"event": "startup"}))
            .unwrap();
        assert!(receipt.task_id.is_none());
        assert_eq!(receipt.action, ReceiptAction::SystemEvent);
        assert!(kernel.verify_chain("c1", 10).unwrap().valid);
    }

    #[test]
    fn pending_count_tracks_dispatch() {
        let kernel = make_kernel();
        kernel
            .create_task(NewTask::new("c1", "ghl_event", json!({}), 5))
            .unwrap();
        assert_eq!(kernel.count_pending_tasks("c1").unwrap(), 1);
        kernel.run_next_task_for("c1").unwrap();
        assert_eq!(kernel.count_pending_tasks("c1").unwrap(), 0);
    }
}
