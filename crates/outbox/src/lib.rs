//! `dteflow-outbox` — the outbox relay.
//!
//! Business actions durably record an [`OutboxEvent`] in the same
//! transaction as their state change; this crate relays those events to
//! downstream queues afterwards. One relay round runs under the
//! `outbox:processing` distributed lock, fetches a bounded batch of ready
//! events in creation order, and hands each to a publisher keyed by its
//! event type. Delivery failures reschedule the event with exponential
//! backoff until the retry ceiling moves it to a terminal `Failed` status;
//! events are never deleted, only transitioned.

pub mod backoff;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod publisher;
pub mod relay;
pub mod store;

pub use backoff::RetryBackoff;
pub use event::{EventStatus, EventType, OutboxEvent, far_future};
pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use publisher::{EventPublisher, PublishError, PublisherRegistry};
pub use relay::{
    DeliverySummary, OutboxError, OutboxRelay, RelayConfig, RelayStatsSnapshot, RoundOutcome,
};
pub use store::{OutboxStore, OutboxStoreError, StatusCounts};
