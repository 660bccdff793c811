//! Downstream delivery seam and the type-keyed publisher registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{EventType, OutboxEvent};

/// Why a downstream hand-off did not happen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The queue refused or was unreachable; retry with backoff.
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// No publisher can ever take this event; permanent.
    #[error("event is unroutable: {0}")]
    Unroutable(String),
}

impl PublishError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn unroutable(msg: impl Into<String>) -> Self {
        Self::Unroutable(msg.into())
    }
}

/// Hands one event to a downstream queue.
///
/// A black box that can fail transiently; implementations must be idempotent
/// on the event's business key because the relay guarantees at-least-once,
/// not exactly-once.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError>;
}

/// Routes events to publishers by event type.
///
/// Lookup failure is an [`PublishError::Unroutable`]: the backlog can hold
/// types this deployment does not know, and those must fail permanently
/// rather than burn retries.
#[derive(Default)]
pub struct PublisherRegistry {
    publishers: HashMap<EventType, Arc<dyn EventPublisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, event_type: EventType, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.insert(event_type, publisher);
        self
    }

    pub fn recognizes(&self, event_type: &EventType) -> bool {
        self.publishers.contains_key(event_type)
    }

    pub async fn dispatch(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        match self.publishers.get(&event.event_type) {
            Some(publisher) => publisher.publish(event).await,
            None => Err(PublishError::unroutable(format!(
                "no publisher registered for event type '{}'",
                event.event_type
            ))),
        }
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("types", &self.publishers.keys().collect::<Vec<_>>())
            .finish()
    }
}
