//! Postgres-backed backlog.
//!
//! Schema (`outbox_events`): `id uuid primary key, tenant_id uuid,
//! event_type text, payload jsonb, status text, retries int, available_at
//! timestamptz, created_at timestamptz, last_error text`. Rows are only ever
//! inserted and updated; the audit trail is the table itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use dteflow_core::{EventId, TenantId};

use crate::event::{EventStatus, EventType, OutboxEvent};
use crate::store::{OutboxStore, OutboxStoreError, StatusCounts};

/// [`OutboxStore`] on a sqlx Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const EVENT_COLUMNS: &str =
    "id, tenant_id, event_type, payload, status, retries, available_at, created_at, last_error";

#[async_trait::async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, event), fields(event_id = %event.id), err)]
    async fn insert(&self, event: OutboxEvent) -> Result<EventId, OutboxStoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, tenant_id, event_type, payload, status, retries, available_at, created_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.tenant_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.retries as i32)
        .bind(event.available_at)
        .bind(event.created_at)
        .bind(event.last_error.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", event.id, e))?;

        Ok(event.id)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", id, e))?;

        row.map(|r| event_from_row(&r)).transpose()
    }

    #[instrument(skip(self, event), fields(event_id = %event.id), err)]
    async fn update(&self, event: &OutboxEvent) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $2, retries = $3, available_at = $4, last_error = $5
            WHERE id = $1
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.status.as_str())
        .bind(event.retries as i32)
        .bind(event.available_at)
        .bind(event.last_error.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", event.id, e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxStoreError::NotFound(event.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn fetch_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE status = 'pending' AND available_at <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OutboxStoreError::storage(format!("fetch_ready: {e}")))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn fetch_pending_until(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE status = 'pending' AND created_at <= $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OutboxStoreError::storage(format!("fetch_pending_until: {e}")))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_failed(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE tenant_id = $1 AND status = 'failed'
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OutboxStoreError::storage(format!("list_failed: {e}")))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<StatusCounts, OutboxStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM outbox_events GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| OutboxStoreError::storage(format!("counts: {e}")))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| OutboxStoreError::storage(format!("counts row: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| OutboxStoreError::storage(format!("counts row: {e}")))?;
            match EventStatus::parse(&status) {
                Ok(EventStatus::Pending) => counts.pending = total as usize,
                Ok(EventStatus::Sent) => counts.sent = total as usize,
                Ok(EventStatus::Failed) => counts.failed = total as usize,
                Err(_) => {
                    return Err(OutboxStoreError::storage(format!(
                        "unknown status in outbox_events: {status}"
                    )));
                }
            }
        }
        Ok(counts)
    }
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    let read = |e: sqlx::Error| OutboxStoreError::storage(format!("failed to read event row: {e}"));

    let id: uuid::Uuid = row.try_get("id").map_err(read)?;
    let tenant_id: uuid::Uuid = row.try_get("tenant_id").map_err(read)?;
    let event_type: String = row.try_get("event_type").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;
    let retries: i32 = row.try_get("retries").map_err(read)?;

    Ok(OutboxEvent {
        id: EventId::from_uuid(id),
        tenant_id: TenantId::from_uuid(tenant_id),
        event_type: EventType::new(event_type)
            .map_err(|e| OutboxStoreError::storage(e.to_string()))?,
        payload: row.try_get("payload").map_err(read)?,
        status: EventStatus::parse(&status).map_err(|e| OutboxStoreError::storage(e.to_string()))?,
        retries: retries.max(0) as u32,
        available_at: row.try_get("available_at").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        last_error: row.try_get("last_error").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, id: EventId, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            // 23505: unique violation, the event was already recorded.
            if db_err.code().as_deref() == Some("23505") {
                OutboxStoreError::AlreadyExists(id)
            } else {
                OutboxStoreError::storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ))
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::storage(format!("connection pool closed in {operation}"))
        }
        other => OutboxStoreError::storage(format!("{operation}: {other}")),
    }
}
