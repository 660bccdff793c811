//! In-memory operation store for tests and single-node development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dteflow_core::{OperationId, TenantId};

use crate::operation::{OperationStatus, RetryableOperation};
use crate::store::{OperationStore, OperationStoreError};

/// `RwLock<HashMap>` implementation of [`OperationStore`].
#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    operations: RwLock<HashMap<OperationId, RetryableOperation>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sorted(mut operations: Vec<RetryableOperation>) -> Vec<RetryableOperation> {
        operations.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.id.as_uuid().cmp(b.id.as_uuid()))
        });
        operations
    }
}

#[async_trait::async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn insert(
        &self,
        operation: RetryableOperation,
    ) -> Result<OperationId, OperationStoreError> {
        let mut operations = self.operations.write().unwrap();
        if operations.contains_key(&operation.id) {
            return Err(OperationStoreError::AlreadyExists(operation.id));
        }
        let id = operation.id;
        operations.insert(id, operation);
        Ok(id)
    }

    async fn get(
        &self,
        id: OperationId,
    ) -> Result<Option<RetryableOperation>, OperationStoreError> {
        Ok(self.operations.read().unwrap().get(&id).cloned())
    }

    async fn update(&self, operation: &RetryableOperation) -> Result<(), OperationStoreError> {
        let mut operations = self.operations.write().unwrap();
        if !operations.contains_key(&operation.id) {
            return Err(OperationStoreError::NotFound(operation.id));
        }
        operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn fetch_open(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<RetryableOperation>, OperationStoreError> {
        let operations = self.operations.read().unwrap();
        let open = operations
            .values()
            .filter(|op| op.tenant_id == tenant_id && op.status.is_open())
            .cloned()
            .collect();
        Ok(Self::sorted(open))
    }

    async fn tenants_with_open_work(&self) -> Result<Vec<TenantId>, OperationStoreError> {
        let operations = self.operations.read().unwrap();
        let mut tenants: Vec<TenantId> = operations
            .values()
            .filter(|op| op.status.is_open())
            .map(|op| op.tenant_id)
            .collect();
        tenants.sort_by_key(|t| *t.as_uuid());
        tenants.dedup();
        Ok(tenants)
    }

    async fn list_errored(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<RetryableOperation>, OperationStoreError> {
        let operations = self.operations.read().unwrap();
        let errored = operations
            .values()
            .filter(|op| op.tenant_id == tenant_id && op.status == OperationStatus::Error)
            .cloned()
            .collect();
        Ok(Self::sorted(errored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fetch_open_filters_by_tenant_and_status() {
        let store = InMemoryOperationStore::new();
        let tenant = TenantId::new();
        let other = TenantId::new();

        let open = RetryableOperation::transmit(tenant, "A", json!({}));
        let mut settled = RetryableOperation::transmit(tenant, "B", json!({}));
        settled.status = OperationStatus::Error;
        let foreign = RetryableOperation::transmit(other, "C", json!({}));

        store.insert(open.clone()).await.unwrap();
        store.insert(settled).await.unwrap();
        store.insert(foreign).await.unwrap();

        let fetched = store.fetch_open(tenant).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, open.id);
    }

    #[tokio::test]
    async fn tenants_with_open_work_deduplicates() {
        let store = InMemoryOperationStore::new();
        let tenant = TenantId::new();
        store
            .insert(RetryableOperation::invalidate(tenant, "A"))
            .await
            .unwrap();
        store
            .insert(RetryableOperation::invalidate(tenant, "B"))
            .await
            .unwrap();

        assert_eq!(store.tenants_with_open_work().await.unwrap(), vec![tenant]);
    }

    #[tokio::test]
    async fn update_requires_an_existing_record() {
        let store = InMemoryOperationStore::new();
        let ghost = RetryableOperation::invalidate(TenantId::new(), "A");
        assert!(matches!(
            store.update(&ghost).await,
            Err(OperationStoreError::NotFound(_))
        ));
    }
}
