//! `taskgate-kernel` – policy-gated task execution with an audit ledger.
//!
//! The kernel does not perform work itself.  It decides whether a task may
//! run, hands it to exactly one worker, and records every step in the
//! client's hash-chained receipt ledger.
//!
//! # Modules
//!
//! - [`policy_engine`] – [`PolicyEngine`][policy_engine::PolicyEngine]:
//!   evaluates each new task against the stored rules and applies the
//!   allow / require-approval / deny decision.
//! - [`worker_registry`] – [`WorkerRegistry`][worker_registry::WorkerRegistry]:
//!   the static `task_type → Worker` table, including schema-typed workers.
//! - [`retry_policy`] – [`RetryPolicy`][retry_policy::RetryPolicy]:
//!   attempt limits and exponential backoff, overridable per `task_type`.
//! - [`dispatcher`] – [`Dispatcher`][dispatcher::Dispatcher]:
//!   claim → execute → resolve, plus the stale-claim reaper.
//! - [`approval`] – [`ApprovalService`][approval::ApprovalService]:
//!   owner approval and cancellation of tasks that have not started.
//! - [`health`] – [`HealthMonitor`][health::HealthMonitor]:
//!   chain verification and queue liveness report.
//! - [`ingest`] – [`InboundEvent`][ingest::InboundEvent]: webhook events as tasks.
//! - [`kernel`] – [`Kernel`][kernel::Kernel]: the facade tying it together.

pub mod approval;
pub mod dispatcher;
pub mod health;
pub mod ingest;
pub mod kernel;
pub mod policy_engine;
pub mod retry_policy;
pub mod worker_registry;

pub use approval::ApprovalService;
pub use dispatcher::Dispatcher;
pub use health::{ChainHealth, HealthMonitor, HealthReport};
pub use ingest::InboundEvent;
pub use kernel::Kernel;
pub use policy_engine::PolicyEngine;
pub use retry_policy::{RetryPolicy, RetryRule};
pub use worker_registry::{TypedWorker, Worker, WorkerError, WorkerRegistry};
