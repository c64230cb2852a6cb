//! Shared data model for the taskgate kernel.
//!
//! Every crate in the workspace speaks in these types: the [`Task`] record and
//! its [`TaskStatus`] state machine, the hash-chained [`Receipt`], policy
//! [`Decision`]s, and the [`KernelError`] taxonomy surfaced to callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Lowest accepted task priority.
pub const MIN_PRIORITY: u8 = 0;
/// Highest accepted task priority.
pub const MAX_PRIORITY: u8 = 10;
/// Priority assigned to ingested events that do not carry one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Hard upper bound on rows returned by any list query.
pub const MAX_LIST_LIMIT: usize = 100;
/// Row count used when a filter does not specify a limit.
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Maximum length of a `task_type` identifier.
pub const MAX_TASK_TYPE_LEN: usize = 128;

// ─────────────────────────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────────────────────────

/// Current UTC time truncated to microseconds.
///
/// Stored timestamps are microsecond precision; truncating at the source keeps
/// an in-memory value identical to the one read back from the database.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC-3339 form (`2024-01-01T00:00:00.000000Z`).
///
/// The fixed width makes lexicographic order equal chronological order, which
/// the store relies on for `ORDER BY created_at` and `since` filters.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously produced by [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

// ─────────────────────────────────────────────────────────────────────────────
// TaskStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Task`].
///
/// ```text
/// pending ──► awaiting_approval ──► pending      (approval)
/// pending ──► claimed ──► completed
///             claimed ──► pending                (retryable failure)
///             claimed ──► failed                 (retries exhausted)
/// pending | awaiting_approval ──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    AwaitingApproval,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::AwaitingApproval,
        TaskStatus::Claimed,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// `true` for states no transition ever leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self → next` is an edge of the task state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingApproval)
                | (Pending, Claimed)
                | (Pending, Cancelled)
                | (AwaitingApproval, Pending)
                | (AwaitingApproval, Cancelled)
                | (Claimed, Completed)
                | (Claimed, Pending)
                | (Claimed, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| KernelError::Validation(format!("unknown task status '{s}'")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────────────────

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    /// Tenant partition key; fixed for the lifetime of the task.
    pub client_id: String,
    /// Selects the worker that executes this task.
    pub task_type: String,
    /// Schema-free data interpreted by the worker.
    pub payload: Value,
    /// 0–10, higher dispatched first.
    pub priority: u8,
    pub status: TaskStatus,
    /// Failed execution attempts so far.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a retried task becomes claimable again.
    pub available_at: Option<DateTime<Utc>>,
}

/// Arguments to `createTask`, validated before anything is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub client_id: String,
    pub task_type: String,
    pub payload: Value,
    pub priority: u8,
}

impl NewTask {
    pub fn new(
        client_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: Value,
        priority: u8,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            task_type: task_type.into(),
            payload,
            priority,
        }
    }

    /// Reject malformed `client_id`, `task_type`, `payload` or `priority`.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.client_id.trim().is_empty() {
            return Err(KernelError::Validation("client_id must not be empty".into()));
        }
        if self.task_type.trim().is_empty() {
            return Err(KernelError::Validation("task_type must not be empty".into()));
        }
        if self.task_type.len() > MAX_TASK_TYPE_LEN {
            return Err(KernelError::Validation(format!(
                "task_type exceeds {MAX_TASK_TYPE_LEN} characters"
            )));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(KernelError::Validation(
                "payload must be a JSON object".into(),
            ));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(KernelError::Validation(format!(
                "priority {} out of range [{MIN_PRIORITY}, {MAX_PRIORITY}]",
                self.priority
            )));
        }
        Ok(())
    }
}

/// Read-only filter for `getTasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// `limit` clamped to [`MAX_LIST_LIMIT`].
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_LIST_LIMIT)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────────────────

/// Who or what caused a receipt: `system`, or `user:<identifier>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Actor {
    System,
    User(String),
}

impl Actor {
    pub fn user(identifier: impl Into<String>) -> Self {
        Actor::User(identifier.into())
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for Actor {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "system" {
            return Ok(Actor::System);
        }
        match s.strip_prefix("user:") {
            Some(id) if !id.trim().is_empty() => Ok(Actor::User(id.to_string())),
            _ => Err(KernelError::Validation(format!(
                "actor '{s}' must be 'system' or 'user:<identifier>'"
            ))),
        }
    }
}

impl TryFrom<String> for Actor {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receipt
// ─────────────────────────────────────────────────────────────────────────────

/// Closed vocabulary of ledger actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptAction {
    TaskCreated,
    PolicyChecked,
    TaskClaimed,
    WorkerExecuted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    OwnerApproval,
    PolicyCreated,
    PolicyUpdated,
    SystemEvent,
}

impl ReceiptAction {
    pub const ALL: [ReceiptAction; 11] = [
        ReceiptAction::TaskCreated,
        ReceiptAction::PolicyChecked,
        ReceiptAction::TaskClaimed,
        ReceiptAction::WorkerExecuted,
        ReceiptAction::TaskCompleted,
        ReceiptAction::TaskFailed,
        ReceiptAction::TaskCancelled,
        ReceiptAction::OwnerApproval,
        ReceiptAction::PolicyCreated,
        ReceiptAction::PolicyUpdated,
        ReceiptAction::SystemEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptAction::TaskCreated => "task_created",
            ReceiptAction::PolicyChecked => "policy_checked",
            ReceiptAction::TaskClaimed => "task_claimed",
            ReceiptAction::WorkerExecuted => "worker_executed",
            ReceiptAction::TaskCompleted => "task_completed",
            ReceiptAction::TaskFailed => "task_failed",
            ReceiptAction::TaskCancelled => "task_cancelled",
            ReceiptAction::OwnerApproval => "owner_approval",
            ReceiptAction::PolicyCreated => "policy_created",
            ReceiptAction::PolicyUpdated => "policy_updated",
            ReceiptAction::SystemEvent => "system_event",
        }
    }
}

impl fmt::Display for ReceiptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReceiptAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| KernelError::Validation(format!("unknown receipt action '{s}'")))
    }
}

/// One immutable, hash-linked audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub client_id: String,
    /// `None` for system-level receipts.
    pub task_id: Option<Uuid>,
    pub action: ReceiptAction,
    pub actor: Actor,
    pub payload: Value,
    /// Hex SHA-256 of the previous receipt in this client's chain.
    pub prev_hash: String,
    /// Hex SHA-256 over `prev_hash` and the canonical receipt fields.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Read filter for `getReceipts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptFilter {
    pub limit: usize,
    pub action: Option<ReceiptAction>,
    pub task_id: Option<Uuid>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
}

impl Default for ReceiptFilter {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            action: None,
            task_id: None,
            since: None,
        }
    }
}

impl ReceiptFilter {
    pub fn with_action(mut self, action: ReceiptAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_LIST_LIMIT)
    }
}

/// Result of re-walking a client's receipt chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Receipts that verified before the first mismatch, or the full count.
    pub checked: usize,
    /// The first receipt whose stored hash or link did not match.
    pub first_mismatch: Option<Uuid>,
}

impl ChainVerification {
    /// Convert a failed verification into [`KernelError::ChainIntegrity`].
    pub fn into_result(self, client_id: &str) -> Result<Self, KernelError> {
        if self.valid {
            Ok(self)
        } else {
            Err(KernelError::ChainIntegrity {
                client_id: client_id.to_string(),
                checked: self.checked,
            })
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a policy gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    RequireApproval,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::RequireApproval => "require_approval",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Decision::Allow),
            "require_approval" => Ok(Decision::RequireApproval),
            "deny" => Ok(Decision::Deny),
            other => Err(KernelError::Validation(format!("unknown decision '{other}'"))),
        }
    }
}

/// A stored rule keyed by `client_id` + `task_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub client_id: String,
    pub task_type: String,
    pub decision: Decision,
    pub updated_by: Actor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// How a claimed task was resolved by one dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    /// Back to `pending`; `retry_count` is the new count.
    Retrying { retry_count: u32, error: String },
    /// Terminal failure.
    Failed { error: String },
}

/// Result of `runNextTask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Idle,
    Resolved { task_id: Uuid, outcome: TaskOutcome },
}

impl DispatchOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, DispatchOutcome::Idle)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy of the kernel API.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Chain integrity violation for client {client_id} after {checked} receipt(s)")]
    ChainIntegrity { client_id: String, checked: usize },

    #[error("Worker execution failed: {0}")]
    WorkerExecution(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl KernelError {
    /// HTTP status an upstream handler should map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            KernelError::Validation(_) | KernelError::InvalidState(_) => 400,
            KernelError::NotFound(_) => 404,
            KernelError::ChainIntegrity { .. }
            | KernelError::WorkerExecution(_)
            | KernelError::ConcurrencyConflict(_)
            | KernelError::Storage(_) => 500,
        }
    }
}
