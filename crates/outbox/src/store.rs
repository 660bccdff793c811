//! Storage seam for the durable event backlog.

use chrono::{DateTime, Utc};

use dteflow_core::{EventId, TenantId};

use crate::event::OutboxEvent;

/// Error from the backlog's backing store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox event not found: {0}")]
    NotFound(EventId),

    #[error("outbox event already exists: {0}")]
    AlreadyExists(EventId),

    #[error("outbox storage error: {0}")]
    Storage(String),
}

impl OutboxStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Per-status totals, for triage dashboards and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
}

/// The durable, ordered backlog of outbox events.
///
/// Ordering contract: fetches return events by `created_at` ascending (ties
/// broken by id, which is time-ordered), so a relay round processes the
/// backlog strictly in commit order.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Record a new event. Fails if the id is already present.
    async fn insert(&self, event: OutboxEvent) -> Result<EventId, OutboxStoreError>;

    /// Fetch a single event by id.
    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    /// Persist an updated event. Fails if the id is unknown.
    async fn update(&self, event: &OutboxEvent) -> Result<(), OutboxStoreError>;

    /// Up to `limit` pending events with `available_at ≤ now`, in creation
    /// order.
    async fn fetch_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// All pending events created at or before `cutoff`, regardless of
    /// `available_at`; the replay path.
    async fn fetch_pending_until(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Dead-lettered events for one tenant, newest first.
    async fn list_failed(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Per-status totals across all tenants.
    async fn counts(&self) -> Result<StatusCounts, OutboxStoreError>;
}
