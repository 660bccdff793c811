//! Postgres-backed operation store.
//!
//! Schema (`contingency_operations`): `id uuid primary key, tenant_id uuid,
//! business_key text, kind text, status text, attempt_count int, last_error
//! text, seal text, document jsonb, accepted_at timestamptz, created_at
//! timestamptz, updated_at timestamptz`.

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tracing::instrument;

use dteflow_core::{OperationId, TenantId};

use crate::operation::{OperationKind, OperationStatus, RetryableOperation};
use crate::store::{OperationStore, OperationStoreError};

/// [`OperationStore`] on a sqlx Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresOperationStore {
    pool: Arc<PgPool>,
}

impl PostgresOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const OPERATION_COLUMNS: &str = "id, tenant_id, business_key, kind, status, attempt_count, \
     last_error, seal, document, accepted_at, created_at, updated_at";

#[async_trait::async_trait]
impl OperationStore for PostgresOperationStore {
    #[instrument(skip(self, operation), fields(operation_id = %operation.id), err)]
    async fn insert(
        &self,
        operation: RetryableOperation,
    ) -> Result<OperationId, OperationStoreError> {
        sqlx::query(
            r#"
            INSERT INTO contingency_operations
                (id, tenant_id, business_key, kind, status, attempt_count,
                 last_error, seal, document, accepted_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(operation.id.as_uuid())
        .bind(operation.tenant_id.as_uuid())
        .bind(&operation.business_key)
        .bind(operation.kind.as_str())
        .bind(operation.status.as_str())
        .bind(operation.attempt_count as i32)
        .bind(operation.last_error.as_deref())
        .bind(operation.seal.as_deref())
        .bind(&operation.document)
        .bind(operation.accepted_at)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", operation.id, e))?;

        Ok(operation.id)
    }

    #[instrument(skip(self), fields(operation_id = %id), err)]
    async fn get(
        &self,
        id: OperationId,
    ) -> Result<Option<RetryableOperation>, OperationStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM contingency_operations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", id, e))?;

        row.map(|r| operation_from_row(&r)).transpose()
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id), err)]
    async fn update(&self, operation: &RetryableOperation) -> Result<(), OperationStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE contingency_operations
            SET status = $2, attempt_count = $3, last_error = $4, seal = $5,
                accepted_at = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(operation.id.as_uuid())
        .bind(operation.status.as_str())
        .bind(operation.attempt_count as i32)
        .bind(operation.last_error.as_deref())
        .bind(operation.seal.as_deref())
        .bind(operation.accepted_at)
        .bind(operation.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", operation.id, e))?;

        if result.rows_affected() == 0 {
            return Err(OperationStoreError::NotFound(operation.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn fetch_open(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<RetryableOperation>, OperationStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM contingency_operations
            WHERE tenant_id = $1 AND status IN ('pending', 'processing')
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OperationStoreError::storage(format!("fetch_open: {e}")))?;

        rows.iter().map(operation_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn tenants_with_open_work(&self) -> Result<Vec<TenantId>, OperationStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT tenant_id
            FROM contingency_operations
            WHERE status IN ('pending', 'processing')
            ORDER BY tenant_id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OperationStoreError::storage(format!("tenants_with_open_work: {e}")))?;

        rows.iter()
            .map(|row| {
                let id: uuid::Uuid = row
                    .try_get("tenant_id")
                    .map_err(|e| OperationStoreError::storage(format!("tenant row: {e}")))?;
                Ok(TenantId::from_uuid(id))
            })
            .collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_errored(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<RetryableOperation>, OperationStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM contingency_operations
            WHERE tenant_id = $1 AND status = 'error'
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OperationStoreError::storage(format!("list_errored: {e}")))?;

        rows.iter().map(operation_from_row).collect()
    }
}

fn operation_from_row(
    row: &sqlx::postgres::PgRow,
) -> Result<RetryableOperation, OperationStoreError> {
    let read =
        |e: sqlx::Error| OperationStoreError::storage(format!("failed to read operation row: {e}"));

    let id: uuid::Uuid = row.try_get("id").map_err(read)?;
    let tenant_id: uuid::Uuid = row.try_get("tenant_id").map_err(read)?;
    let kind: String = row.try_get("kind").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(read)?;

    Ok(RetryableOperation {
        id: OperationId::from_uuid(id),
        tenant_id: TenantId::from_uuid(tenant_id),
        business_key: row.try_get("business_key").map_err(read)?,
        kind: OperationKind::parse(&kind).map_err(|e| OperationStoreError::storage(e.to_string()))?,
        status: OperationStatus::parse(&status)
            .map_err(|e| OperationStoreError::storage(e.to_string()))?,
        attempt_count: attempt_count.max(0) as u32,
        last_error: row.try_get("last_error").map_err(read)?,
        seal: row.try_get("seal").map_err(read)?,
        document: row.try_get("document").map_err(read)?,
        accepted_at: row.try_get("accepted_at").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, id: OperationId, err: sqlx::Error) -> OperationStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            // 23505: unique violation, the operation was already queued.
            if db_err.code().as_deref() == Some("23505") {
                OperationStoreError::AlreadyExists(id)
            } else {
                OperationStoreError::storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ))
            }
        }
        sqlx::Error::PoolClosed => {
            OperationStoreError::storage(format!("connection pool closed in {operation}"))
        }
        other => OperationStoreError::storage(format!("{operation}: {other}")),
    }
}
