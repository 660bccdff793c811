//! Storage seam for queued operations.

use dteflow_core::{OperationId, TenantId};

use crate::operation::RetryableOperation;

/// Error from the operation store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationStoreError {
    #[error("operation not found: {0}")]
    NotFound(OperationId),

    #[error("operation already exists: {0}")]
    AlreadyExists(OperationId),

    #[error("operation storage error: {0}")]
    Storage(String),
}

impl OperationStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Durable store of [`RetryableOperation`] records.
#[async_trait::async_trait]
pub trait OperationStore: Send + Sync {
    /// Queue a new operation.
    async fn insert(&self, operation: RetryableOperation)
    -> Result<OperationId, OperationStoreError>;

    async fn get(&self, id: OperationId) -> Result<Option<RetryableOperation>, OperationStoreError>;

    /// Persist an updated operation. Fails if the id is unknown.
    async fn update(&self, operation: &RetryableOperation) -> Result<(), OperationStoreError>;

    /// Open (pending or processing) operations for one tenant, in creation
    /// order.
    async fn fetch_open(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<RetryableOperation>, OperationStoreError>;

    /// Tenants that currently have open operations; drives the sweep loop.
    async fn tenants_with_open_work(&self) -> Result<Vec<TenantId>, OperationStoreError>;

    /// Terminal `Error` operations for one tenant, for manual triage.
    async fn list_errored(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<RetryableOperation>, OperationStoreError>;
}
