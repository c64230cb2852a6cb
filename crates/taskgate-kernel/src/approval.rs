//! [`ApprovalService`] – owner decisions on gated tasks.
//!
//! Approval never runs the task inline.  It only makes the task `pending`
//! again, so execution always goes through the dispatcher and its receipts.

use std::sync::Arc;

use serde_json::json;
use taskgate_store::receipt_ledger::{self, NewReceipt};
use taskgate_store::{Database, task_store};
use taskgate_types::{Actor, KernelError, ReceiptAction, Task, TaskStatus, now};
use tracing::{info, instrument};
use uuid::Uuid;

pub struct ApprovalService {
    db: Arc<Database>,
}

impl ApprovalService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Release an `awaiting_approval` task for dispatch.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] when `client_id` owns no such task;
    /// [`KernelError::InvalidState`] when it is not awaiting approval, in
    /// which case nothing is written.
    #[instrument(skip(self, actor, reason), fields(actor = %actor))]
    pub fn approve_task(
        &self,
        task_id: Uuid,
        client_id: &str,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Task, KernelError> {
        let approved = self.db.write(|tx| {
            let current = task_store::get_task_for_client(tx, task_id, client_id)?;
            if current.status != TaskStatus::AwaitingApproval {
                return Err(KernelError::InvalidState(format!(
                    "Cannot approve task {task_id}: status is {}",
                    current.status
                ))
                .into());
            }
            let approved = Task {
                status: TaskStatus::Pending,
                retry_count: 0,
                available_at: None,
                ..current.clone()
            };
            task_store::apply_transition(tx, &current, &approved)?;
            receipt_ledger::append(
                tx,
                NewReceipt::new(client_id, ReceiptAction::OwnerApproval, actor.clone())
                    .task(task_id)
                    .payload(json!({ "reason": reason, "task_type": current.task_type })),
            )?;
            Ok(approved)
        })?;
        info!(%task_id, client_id, "task approved");
        Ok(approved)
    }

    /// Cancel a task that has not started.
    ///
    /// Only `pending` and `awaiting_approval` tasks can be cancelled; a
    /// claimed task runs to its outcome.
    #[instrument(skip(self, actor, reason), fields(actor = %actor))]
    pub fn cancel_task(
        &self,
        task_id: Uuid,
        client_id: &str,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Task, KernelError> {
        let cancelled = self.db.write(|tx| {
            let current = task_store::get_task_for_client(tx, task_id, client_id)?;
            if !matches!(
                current.status,
                TaskStatus::Pending | TaskStatus::AwaitingApproval
            ) {
                return Err(KernelError::InvalidState(format!(
                    "Cannot cancel task {task_id}: status is {}",
                    current.status
                ))
                .into());
            }
            let cancelled = Task {
                status: TaskStatus::Cancelled,
                completed_at: Some(now()),
                ..current.clone()
            };
            task_store::apply_transition(tx, &current, &cancelled)?;
            receipt_ledger::append(
                tx,
                NewReceipt::new(client_id, ReceiptAction::TaskCancelled, actor.clone())
                    .task(task_id)
                    .payload(json!({ "reason": reason, "previous_status": current.status })),
            )?;
            Ok(cancelled)
        })?;
        info!(%task_id, client_id, "task cancelled");
        Ok(cancelled)
    }
}
