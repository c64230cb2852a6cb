//! Built-in workers shipped with the `taskgate` binary.
//!
//! `ghl_event` handles CRM webhook events ingested with source `ghl`; its
//! payload is the `{event_type, data}` shape produced by event ingestion.
//! `noop` succeeds without side effects and is handy for exercising the
//! pipeline from the REPL.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use taskgate_kernel::{TypedWorker, WorkerError, WorkerRegistry};
use tracing::info;

/// A webhook event delivered by the CRM.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GhlEvent {
    /// E.g. `ContactCreate`, `OpportunityStageUpdate`.
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

fn handle_ghl_event(event: GhlEvent) -> Result<Value, WorkerError> {
    if event.event_type.trim().is_empty() {
        return Err(WorkerError::InvalidPayload("event_type is empty".to_string()));
    }
    let location_id = event.data.get("locationId").and_then(Value::as_str);
    info!(event_type = %event.event_type, location_id, "CRM event handled");
    Ok(json!({ "event_type": event.event_type, "handled": true }))
}

/// Registry with every built-in worker.
pub fn build_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry
        .register("ghl_event", TypedWorker::new(handle_ghl_event))
        .register_fn("noop", |_: &Value| Ok(Value::Null));
    registry
}
