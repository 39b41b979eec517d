use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

/// Fire-and-forget event emission. Implementations must never let a delivery
/// failure surface to the mutation that triggered it; log and move on.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: &str, payload: Value);
}

/// Drops every event.
pub struct NullEventBus;

#[async_trait]
impl EventBus for NullEventBus {
    async fn emit(&self, event: &str, _payload: Value) {
        tracing::trace!(event, "event dropped (null bus)");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedEvent {
    pub event: String,
    pub payload: Value,
}

/// Records emitted events for inspection in tests.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<EmittedEvent>>,
}

impl RecordingEventBus {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn emitted(&self) -> Vec<EmittedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn emit(&self, event: &str, payload: Value) {
        let mut events = self.events.lock().await;
        events.push(EmittedEvent {
            event: event.to_string(),
            payload,
        });
    }
}
