//! Mock implementations of core traits for testing.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::{
    events::{EventEnvelope, EventType},
    traits::{EventEmitter, Tool},
    types::ToolOutput,
    Result,
};

// =============================================================================
// Collecting Event Emitter
// =============================================================================

/// Event emitter that records every event for later assertions.
#[derive(Default)]
pub struct CollectingEventEmitter {
    events: Mutex<Vec<EventEnvelope>>,
}

impl CollectingEventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of recorded events of the given type.
    pub fn count(&self, event_type: &EventType) -> usize {
        self.events()
            .iter()
            .filter(|e| &e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventEmitter for CollectingEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

// =============================================================================
// Echo Tool
// =============================================================================

/// Tool that echoes its arguments back.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the arguments back"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        Ok(ToolOutput::text(args.to_string()).with_data(args))
    }
}
