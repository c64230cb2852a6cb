//! Property tests over random sequences of kernel operations.

mod common;

use std::collections::HashMap;

use proptest::prelude::*;
use serde_json::json;
use taskgate_kernel::Kernel;
use taskgate_types::{Actor, Decision, NewTask, TaskFilter, TaskStatus};
use uuid::Uuid;

const MAX_RETRIES: u32 = 2;
const CLIENTS: [&str; 2] = ["alpha", "beta"];
/// `noop` succeeds, `flaky` always fails, `refund` is gated by policy
/// changes, `ghost` has no worker.
const TASK_TYPES: [&str; 4] = ["noop", "flaky", "refund", "ghost"];

#[derive(Debug, Clone)]
enum Op {
    Create { client: usize, kind: usize, priority: u8 },
    Run,
    Approve(usize),
    Cancel(usize),
    SetPolicy { client: usize, decision: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..CLIENTS.len(), 0..TASK_TYPES.len(), 0u8..=10)
            .prop_map(|(client, kind, priority)| Op::Create { client, kind, priority }),
        4 => Just(Op::Run),
        1 => (0usize..64).prop_map(Op::Approve),
        1 => (0usize..64).prop_map(Op::Cancel),
        1 => (0..CLIENTS.len(), 0usize..3)
            .prop_map(|(client, decision)| Op::SetPolicy { client, decision }),
    ]
}

const DECISIONS: [Decision; 3] = [Decision::Allow, Decision::RequireApproval, Decision::Deny];

/// Whether one kernel call may move a task from `from` to `to`.
///
/// A dispatch pass chains `pending → claimed → {completed, pending, failed}`
/// and creation may gate `pending` straight to `awaiting_approval` or
/// `cancelled`, so up to two edges can be crossed per call.
fn reachable_in_one_call(from: TaskStatus, to: TaskStatus) -> bool {
    from == to
        || from.can_transition_to(to)
        || (from.can_transition_to(TaskStatus::Claimed)
            && TaskStatus::Claimed.can_transition_to(to))
}

fn snapshot(kernel: &Kernel) -> HashMap<Uuid, (TaskStatus, u32)> {
    CLIENTS
        .iter()
        .flat_map(|client| {
            kernel
                .get_tasks(client, &TaskFilter::default().with_limit(100))
                .unwrap()
        })
        .map(|task| (task.task_id, (task.status, task.retry_count)))
        .collect()
}

fn apply(kernel: &Kernel, op: &Op, created: &mut Vec<(usize, Uuid)>) {
    let admin = Actor::user("admin");
    match *op {
        Op::Create { client, kind, priority } => {
            let task = kernel
                .create_task(NewTask::new(CLIENTS[client], TASK_TYPES[kind], json!({}), priority))
                .unwrap();
            created.push((client, task.task_id));
        }
        Op::Run => {
            kernel.run_next_task().unwrap();
        }
        Op::Approve(index) | Op::Cancel(index) => {
            if created.is_empty() {
                return;
            }
            let (client, task_id) = created[index % created.len()];
            let result = if matches!(op, Op::Approve(_)) {
                kernel.approve_task(task_id, CLIENTS[client], &admin, None)
            } else {
                kernel.cancel_task(task_id, CLIENTS[client], &admin, None)
            };
            if let Err(err) = result {
                assert_eq!(err.status_code(), 400, "unexpected error {err}");
            }
        }
        Op::SetPolicy { client, decision } => {
            kernel
                .set_policy(CLIENTS[client], "refund", DECISIONS[decision], &admin)
                .unwrap();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Status only ever follows state-machine edges, retries stay bounded and
    /// every chain verifies.
    #[test]
    fn random_operations_preserve_kernel_invariants(ops in prop::collection::vec(arb_op(), 1..40)) {
        let kernel = common::kernel_with(common::default_registry(), MAX_RETRIES);
        let mut created = Vec::new();
        let mut before = snapshot(&kernel);

        for op in &ops {
            apply(&kernel, op, &mut created);
            let after = snapshot(&kernel);
            for (task_id, (status, retry_count)) in &after {
                prop_assert!(*retry_count <= MAX_RETRIES);
                if let Some((previous, _)) = before.get(task_id) {
                    prop_assert!(
                        reachable_in_one_call(*previous, *status),
                        "{op:?} moved {task_id} from {previous} to {status}"
                    );
                    if previous.is_terminal() {
                        prop_assert_eq!(previous, status);
                    }
                } else {
                    prop_assert!(matches!(
                        status,
                        TaskStatus::Pending | TaskStatus::AwaitingApproval | TaskStatus::Cancelled
                    ));
                }
            }
            before = after;
        }

        for client in CLIENTS {
            let verification = kernel.verify_chain(client, 10_000).unwrap();
            prop_assert!(verification.valid, "chain of {} broken", client);
        }
    }

    /// Corrupting any single receipt is caught at exactly its position.
    #[test]
    fn single_corruption_is_located(creates in 1usize..8, pick in any::<prop::sample::Index>()) {
        let kernel = common::kernel();
        for _ in 0..creates {
            kernel.create_task(NewTask::new("alpha", "noop", json!({}), 5)).unwrap();
            kernel.run_next_task().unwrap();
        }
        let chain = common::chain(&kernel, "alpha");
        let position = pick.index(chain.len());
        common::tamper(
            kernel.database(),
            &format!(
                "UPDATE receipts SET hash = '{}' WHERE receipt_id = '{}'",
                "0".repeat(63) + "1",
                chain[position].receipt_id
            ),
        );

        let verification = kernel.verify_chain("alpha", 10_000).unwrap();
        prop_assert!(!verification.valid);
        prop_assert_eq!(verification.checked, position);
    }
}
