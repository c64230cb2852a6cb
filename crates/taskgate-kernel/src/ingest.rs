//! Event ingestion – turning inbound webhooks into tasks.
//!
//! An [`InboundEvent`] from source `ghl` with event type `ContactCreate`
//! becomes a `ghl_event` task whose payload is
//! `{"event_type": "ContactCreate", "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use taskgate_types::{DEFAULT_PRIORITY, KernelError, NewTask};

/// An external event addressed to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub client_id: String,
    /// Origin system, e.g. `ghl`.
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl InboundEvent {
    /// `task_type` this event is dispatched as.
    pub fn task_type(&self) -> String {
        format!("{}_event", self.source)
    }

    /// Value recorded as `source` in the `task_created` receipt.
    pub fn receipt_source(&self) -> String {
        format!("event:{}", self.source)
    }

    pub fn to_new_task(&self) -> Result<NewTask, KernelError> {
        if self.source.trim().is_empty() {
            return Err(KernelError::Validation("event source must not be empty".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(KernelError::Validation("event_type must not be empty".into()));
        }
        Ok(NewTask::new(
            self.client_id.clone(),
            self.task_type(),
            json!({ "event_type": self.event_type, "data": self.data }),
            self.priority.unwrap_or(DEFAULT_PRIORITY),
        ))
    }
}
