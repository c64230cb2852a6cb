//! [`WorkerRegistry`] – maps `task_type` strings to their [`Worker`].
//!
//! The registry is assembled once at process start and handed to the
//! [`Dispatcher`][crate::dispatcher::Dispatcher] behind an `Arc`; it is never
//! mutated after that and there is no global instance.
//!
//! A worker receives the task's schema-free JSON payload.  [`TypedWorker`]
//! narrows it to a concrete `serde` type at the boundary, so a payload that
//! does not fit is rejected as [`WorkerError::InvalidPayload`] before the
//! handler runs.
//!
//! # Example
//!
//! ```
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//! use serde_json::{Value, json};
//! use taskgate_kernel::worker_registry::{TypedWorker, WorkerError, WorkerRegistry};
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct Refund {
//!     order_id: String,
//! }
//!
//! let mut registry = WorkerRegistry::new();
//! registry.register_fn("noop", |_payload: &Value| Ok(Value::Null));
//! registry.register(
//!     "refund",
//!     TypedWorker::new(|refund: Refund| Ok(json!({ "refunded": refund.order_id }))),
//! );
//!
//! let worker = registry.get("refund").unwrap();
//! assert!(worker.execute(&json!({ "order_id": "A-1" })).is_ok());
//! assert!(matches!(
//!     worker.execute(&json!({})),
//!     Err(WorkerError::InvalidPayload(_))
//! ));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

/// Failure reported by a worker for one attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The side effect failed; the attempt may be retried.
    #[error("{0}")]
    Failed(String),
    /// The payload does not have the shape this worker expects.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl WorkerError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkerError::Failed(message.into())
    }

    /// An invalid payload fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Failed(_))
    }

    /// Value recorded as `error` in the task's receipts.
    pub fn receipt_error(&self) -> String {
        match self {
            WorkerError::Failed(message) => message.clone(),
            WorkerError::InvalidPayload(_) => "invalid_payload".to_string(),
        }
    }
}

/// Performs the side effects of one `task_type`.
///
/// Workers may block; the dispatcher holds no database lock while one runs.
pub trait Worker: Send + Sync {
    /// Execute one attempt and return a JSON result recorded on completion.
    fn execute(&self, payload: &Value) -> Result<Value, WorkerError>;

    /// JSON Schema of the accepted payload, when the worker declares one.
    fn payload_schema(&self) -> Option<Value> {
        None
    }
}

impl<F> Worker for F
where
    F: Fn(&Value) -> Result<Value, WorkerError> + Send + Sync,
{
    fn execute(&self, payload: &Value) -> Result<Value, WorkerError> {
        self(payload)
    }
}

/// A worker whose payload is deserialized into `P` before `handler` runs.
pub struct TypedWorker<P, F> {
    handler: F,
    _payload: PhantomData<fn(P)>,
}

impl<P, F> TypedWorker<P, F>
where
    P: DeserializeOwned + JsonSchema,
    F: Fn(P) -> Result<Value, WorkerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _payload: PhantomData,
        }
    }
}

impl<P, F> Worker for TypedWorker<P, F>
where
    P: DeserializeOwned + JsonSchema,
    F: Fn(P) -> Result<Value, WorkerError> + Send + Sync,
{
    fn execute(&self, payload: &Value) -> Result<Value, WorkerError> {
        let typed =
            P::deserialize(payload).map_err(|e| WorkerError::InvalidPayload(e.to_string()))?;
        (self.handler)(typed)
    }

    fn payload_schema(&self) -> Option<Value> {
        serde_json::to_value(schemars::schema_for!(P)).ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WorkerRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Static `task_type → Worker` table.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Box<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` for `task_type`, replacing any previous one.
    pub fn register<W>(&mut self, task_type: impl Into<String>, worker: W) -> &mut Self
    where
        W: Worker + 'static,
    {
        self.workers.insert(task_type.into(), Box::new(worker));
        self
    }

    /// Register a plain function over the raw JSON payload.
    pub fn register_fn<F>(&mut self, task_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Value, WorkerError> + Send + Sync + 'static,
    {
        self.register(task_type, handler)
    }

    pub fn get(&self, task_type: &str) -> Option<&dyn Worker> {
        self.workers.get(task_type).map(|worker| worker.as_ref())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.workers.contains_key(task_type)
    }

    /// Registered task types in sorted order.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn payload_schema(&self, task_type: &str) -> Option<Value> {
        self.get(task_type).and_then(|worker| worker.payload_schema())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct Greeting {
        name: String,
    }

    fn make_registry() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry
            .register_fn("echo", |payload: &Value| Ok(payload.clone()))
            .register(
                "greet",
                TypedWorker::new(|g: Greeting| Ok(json!({ "greeting": format!("hi {}", g.name) }))),
            );
        registry
    }

    #[test]
    fn lookup_by_task_type() {
        let registry = make_registry();
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.task_types(), vec!["echo", "greet"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn plain_worker_sees_raw_payload() {
        let registry = make_registry();
        let out = registry.get("echo").unwrap().execute(&json!({"a": 1})).unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[test]
    fn typed_worker_deserializes_payload() {
        let registry = make_registry();
        let out = registry
            .get("greet")
            .unwrap()
            .execute(&json!({"name": "ops"}))
            .unwrap();
        assert_eq!(out["greeting"], "hi ops");
    }

    #[test]
    fn typed_worker_rejects_mismatched_payload() {
        let registry = make_registry();
        let err = registry
            .get("greet")
            .unwrap()
            .execute(&json!({"name": 7}))
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidPayload(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.receipt_error(), "invalid_payload");
    }

    #[test]
    fn typed_worker_exposes_schema() {
        let registry = make_registry();
        let schema = registry.payload_schema("greet").unwrap();
        assert_eq!(schema["properties"]["name"]["type"], "string");
        assert!(registry.payload_schema("echo").is_none());
    }

    #[test]
    fn re_registering_replaces_worker() {
        let mut registry = make_registry();
        registry.register_fn("echo", |_: &Value| Err(WorkerError::failed("down")));
        let err = registry.get("echo").unwrap().execute(&json!({})).unwrap_err();
        assert_eq!(err, WorkerError::failed("down"));
        assert_eq!(registry.len(), 2);
    }
}
