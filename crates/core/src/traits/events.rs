use crate::events::EventEnvelope;
use async_trait::async_trait;

/// Sink for audit events.
///
/// Emitting never fails from the caller's point of view; sinks log their own
/// write errors. Components hold an `Option<Arc<dyn EventEmitter>>` and skip
/// emission when none is configured.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: EventEnvelope);
}
