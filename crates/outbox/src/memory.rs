//! In-memory backlog for tests and single-node development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use dteflow_core::{EventId, TenantId};

use crate::event::{EventStatus, OutboxEvent};
use crate::store::{OutboxStore, OutboxStoreError, StatusCounts};

/// `RwLock<HashMap>` implementation of [`OutboxStore`].
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    events: RwLock<HashMap<EventId, OutboxEvent>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sorted(mut events: Vec<OutboxEvent>) -> Vec<OutboxEvent> {
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        events
    }
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, event: OutboxEvent) -> Result<EventId, OutboxStoreError> {
        let mut events = self.events.write().unwrap();
        if events.contains_key(&event.id) {
            return Err(OutboxStoreError::AlreadyExists(event.id));
        }
        let id = event.id;
        events.insert(id, event);
        Ok(id)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        Ok(self.events.read().unwrap().get(&id).cloned())
    }

    async fn update(&self, event: &OutboxEvent) -> Result<(), OutboxStoreError> {
        let mut events = self.events.write().unwrap();
        if !events.contains_key(&event.id) {
            return Err(OutboxStoreError::NotFound(event.id));
        }
        events.insert(event.id, event.clone());
        Ok(())
    }

    async fn fetch_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let events = self.events.read().unwrap();
        let ready = events.values().filter(|e| e.is_ready(now)).cloned().collect();
        let mut ready = Self::sorted(ready);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn fetch_pending_until(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let events = self.events.read().unwrap();
        let pending = events
            .values()
            .filter(|e| e.status == EventStatus::Pending && e.created_at <= cutoff)
            .cloned()
            .collect();
        Ok(Self::sorted(pending))
    }

    async fn list_failed(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let events = self.events.read().unwrap();
        let failed = events
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.status == EventStatus::Failed)
            .cloned()
            .collect();
        let mut failed = Self::sorted(failed);
        failed.reverse();
        failed.truncate(limit);
        Ok(failed)
    }

    async fn counts(&self) -> Result<StatusCounts, OutboxStoreError> {
        let events = self.events.read().unwrap();
        let mut counts = StatusCounts::default();
        for event in events.values() {
            match event.status {
                EventStatus::Pending => counts.pending += 1,
                EventStatus::Sent => counts.sent += 1,
                EventStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
