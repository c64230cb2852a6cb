//! [`PolicyEngine`] – the gate every new task passes before it can run.
//!
//! The decision depends only on the stored rule for the task's
//! (`client_id`, `task_type`); no rule means [`Decision::Allow`].  Every
//! evaluation appends a `policy_checked` receipt, allow included.
//!
//! | decision           | effect on a `pending` task                         |
//! |--------------------|----------------------------------------------------|
//! | `allow`            | stays `pending`, eligible for dispatch             |
//! | `require_approval` | `awaiting_approval` until the Approval Service acts |
//! | `deny`             | `cancelled`, with a `task_cancelled` receipt       |

use rusqlite::Connection;
use serde_json::json;
use taskgate_store::receipt_ledger::{self, NewReceipt};
use taskgate_store::{StoreError, policy_store, task_store};
use taskgate_types::{Actor, Decision, ReceiptAction, Task, TaskStatus, now};
use tracing::{debug, info};

/// Stateless evaluator over the policy table.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Decide `task` and record the `policy_checked` receipt.
    pub fn evaluate(&self, conn: &Connection, task: &Task) -> Result<Decision, StoreError> {
        let rule = policy_store::get_policy(conn, &task.client_id, &task.task_type)?;
        let decision = rule.as_ref().map_or(Decision::Allow, |policy| policy.decision);
        receipt_ledger::append(
            conn,
            NewReceipt::new(&task.client_id, ReceiptAction::PolicyChecked, Actor::System)
                .task(task.task_id)
                .payload(json!({
                    "task_type": task.task_type,
                    "decision": decision,
                    "rule_matched": rule.is_some(),
                })),
        )?;
        debug!(task_id = %task.task_id, decision = %decision, "policy evaluated");
        Ok(decision)
    }

    /// Evaluate a freshly inserted `pending` task and apply the decision.
    ///
    /// Returns the task in its post-gate state.  Call inside the same
    /// transaction that inserted it.
    pub fn gate(&self, conn: &Connection, task: Task) -> Result<Task, StoreError> {
        let decision = self.evaluate(conn, &task)?;
        match decision {
            Decision::Allow => Ok(task),
            Decision::RequireApproval => {
                let held = Task {
                    status: TaskStatus::AwaitingApproval,
                    ..task.clone()
                };
                task_store::apply_transition(conn, &task, &held)?;
                info!(
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    "task awaiting approval"
                );
                Ok(held)
            }
            Decision::Deny => {
                let cancelled = Task {
                    status: TaskStatus::Cancelled,
                    completed_at: Some(now()),
                    ..task.clone()
                };
                task_store::apply_transition(conn, &task, &cancelled)?;
                receipt_ledger::append(
                    conn,
                    NewReceipt::new(&task.client_id, ReceiptAction::TaskCancelled, Actor::System)
                        .task(task.task_id)
                        .payload(json!({
                            "reason":
                                format!("denied by policy for task_type '{}'", task.task_type),
                            "decision": decision,
                        })),
                )?;
                info!(
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    "task denied by policy"
                );
                Ok(cancelled)
            }
        }
    }
}
