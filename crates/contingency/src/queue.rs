//! The bounded-attempt sweep over queued operations.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dteflow_core::TenantId;

use crate::authority::AuthorityClient;
use crate::operation::{OperationKind, OperationStatus, RetryableOperation};
use crate::store::{OperationStore, OperationStoreError};

/// Queue construction knobs.
///
/// Deliberately flat: no in-process backoff delay. The sweep interval is the
/// only pacing, and the ceiling caps total attempts against the authority,
/// not wall-clock delay — a different business policy than the outbox's.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failed attempts after which an operation goes to `Error`.
    pub max_attempts: u32,
    /// Cadence of the sweep loop.
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

/// Error of the sweep operations.
#[derive(Debug, thiserror::Error)]
pub enum ContingencyError {
    #[error(transparent)]
    Store(#[from] OperationStoreError),
}

/// What one sweep of a tenant did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Operations attempted this pass.
    pub attempted: usize,
    pub accepted: usize,
    pub still_pending: usize,
    /// Operations that crossed the ceiling this pass.
    pub errored: usize,
}

impl SweepSummary {
    fn absorb(&mut self, other: SweepSummary) {
        self.attempted += other.attempted;
        self.accepted += other.accepted;
        self.still_pending += other.still_pending;
        self.errored += other.errored;
    }
}

/// Sweeps open operations against the authority until each is accepted or
/// out of attempts.
pub struct ContingencyQueue {
    store: Arc<dyn OperationStore>,
    authority: Arc<dyn AuthorityClient>,
    config: QueueConfig,
}

impl ContingencyQueue {
    pub fn new(
        store: Arc<dyn OperationStore>,
        authority: Arc<dyn AuthorityClient>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            authority,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Drive periodic sweeps over every tenant with open work until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "contingency queue started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = shutdown.cancelled() => break,
            }
            if let Err(e) = self.sweep_all().await {
                warn!(error = %e, "contingency sweep failed, will retry next interval");
            }
        }
        info!("contingency queue stopped");
    }

    /// One pass over every tenant that has open operations.
    pub async fn sweep_all(&self) -> Result<SweepSummary, ContingencyError> {
        let mut summary = SweepSummary::default();
        for tenant_id in self.store.tenants_with_open_work().await? {
            summary.absorb(self.process_pending(tenant_id).await?);
        }
        Ok(summary)
    }

    /// Attempt every open operation of one tenant once.
    pub async fn process_pending(
        &self,
        tenant_id: TenantId,
    ) -> Result<SweepSummary, ContingencyError> {
        let open = self.store.fetch_open(tenant_id).await?;
        let mut summary = SweepSummary::default();

        for mut operation in open {
            summary.attempted += 1;
            match self.attempt(&operation).await {
                Ok(receipt) => {
                    match operation.mark_accepted(receipt) {
                        Ok(()) => {
                            info!(
                                operation_id = %operation.id,
                                kind = operation.kind.as_str(),
                                business_key = %operation.business_key,
                                "operation accepted by authority"
                            );
                            summary.accepted += 1;
                        }
                        Err(e) => {
                            warn!(operation_id = %operation.id, error = %e, "illegal operation transition skipped");
                            continue;
                        }
                    }
                }
                Err(e) => {
                    if let Err(violation) =
                        operation.mark_attempt_failed(e.to_string(), self.config.max_attempts)
                    {
                        warn!(operation_id = %operation.id, error = %violation, "illegal operation transition skipped");
                        continue;
                    }
                    if operation.status == OperationStatus::Error {
                        warn!(
                            operation_id = %operation.id,
                            kind = operation.kind.as_str(),
                            attempt_count = operation.attempt_count,
                            error = %e,
                            "operation exhausted its attempt ceiling, manual intervention required"
                        );
                        summary.errored += 1;
                    } else {
                        debug!(
                            operation_id = %operation.id,
                            attempt_count = operation.attempt_count,
                            error = %e,
                            "operation attempt failed, kept pending"
                        );
                        summary.still_pending += 1;
                    }
                }
            }

            if let Err(e) = self.store.update(&operation).await {
                // The record keeps its previous durable state; the attempt
                // may repeat, which is safe on an idempotent business key.
                warn!(operation_id = %operation.id, error = %e, "failed to persist operation transition");
            }
        }
        Ok(summary)
    }

    async fn attempt(
        &self,
        operation: &RetryableOperation,
    ) -> Result<crate::authority::AuthorityReceipt, crate::authority::AuthorityError> {
        match operation.kind {
            OperationKind::Transmit => {
                self.authority
                    .transmit(operation.tenant_id, &operation.document)
                    .await
            }
            OperationKind::Invalidate => {
                self.authority
                    .invalidate(operation.tenant_id, &operation.business_key)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityError, AuthorityReceipt};
    use crate::memory::InMemoryOperationStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects the first `failures` calls, then accepts everything.
    struct ScriptedAuthority {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedAuthority {
        fn arc(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn answer(&self) -> Result<AuthorityReceipt, AuthorityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AuthorityError::new("503 service unavailable"));
            }
            Ok(AuthorityReceipt {
                seal: "SELLO-OK".to_string(),
                confirmed_at: Utc::now(),
            })
        }
    }

    #[async_trait::async_trait]
    impl AuthorityClient for ScriptedAuthority {
        async fn transmit(
            &self,
            _tenant_id: TenantId,
            _document: &serde_json::Value,
        ) -> Result<AuthorityReceipt, AuthorityError> {
            self.answer()
        }

        async fn invalidate(
            &self,
            _tenant_id: TenantId,
            _business_key: &str,
        ) -> Result<AuthorityReceipt, AuthorityError> {
            self.answer()
        }
    }

    fn queue(
        store: Arc<InMemoryOperationStore>,
        authority: Arc<ScriptedAuthority>,
    ) -> ContingencyQueue {
        ContingencyQueue::new(store, authority, QueueConfig::default())
    }

    #[tokio::test]
    async fn successful_transmit_records_seal() {
        let store = InMemoryOperationStore::arc();
        let authority = ScriptedAuthority::arc(0);
        let q = queue(store.clone(), authority.clone());

        let tenant = TenantId::new();
        let id = store
            .insert(RetryableOperation::transmit(
                tenant,
                "DTE-01-00000042",
                json!({"body": "signed"}),
            ))
            .await
            .unwrap();

        let summary = q.process_pending(tenant).await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                attempted: 1,
                accepted: 1,
                ..SweepSummary::default()
            }
        );

        let op = store.get(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Accepted);
        assert_eq!(op.seal.as_deref(), Some("SELLO-OK"));
        assert!(op.accepted_at.is_some());
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn failures_keep_the_operation_pending_without_backoff() {
        let store = InMemoryOperationStore::arc();
        let q = queue(store.clone(), ScriptedAuthority::arc(2));

        let tenant = TenantId::new();
        let id = store
            .insert(RetryableOperation::invalidate(tenant, "DTE-01-00000042"))
            .await
            .unwrap();

        // Two failing sweeps, one accepting sweep; the next sweep is
        // immediately eligible each time.
        for _ in 0..2 {
            let summary = q.process_pending(tenant).await.unwrap();
            assert_eq!(summary.still_pending, 1);
        }
        let summary = q.process_pending(tenant).await.unwrap();
        assert_eq!(summary.accepted, 1);

        let op = store.get(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Accepted);
        assert_eq!(op.attempt_count, 2);
    }

    #[tokio::test]
    async fn invalidate_goes_to_error_on_the_eleventh_failure() {
        let store = InMemoryOperationStore::arc();
        let q = queue(store.clone(), ScriptedAuthority::arc(usize::MAX));

        let tenant = TenantId::new();
        let id = store
            .insert(RetryableOperation::invalidate(tenant, "DTE-01-00000042"))
            .await
            .unwrap();

        for sweep in 1..=10 {
            let summary = q.process_pending(tenant).await.unwrap();
            assert_eq!(summary.still_pending, 1, "sweep {sweep} should stay pending");
        }
        let summary = q.process_pending(tenant).await.unwrap();
        assert_eq!(summary.errored, 1);

        let op = store.get(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Error);
        assert_eq!(op.attempt_count, 11);
        assert!(op.last_error.is_some());

        // Terminal: no further sweeps touch it.
        let summary = q.process_pending(tenant).await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(store.list_errored(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_all_covers_every_tenant_with_open_work() {
        let store = InMemoryOperationStore::arc();
        let authority = ScriptedAuthority::arc(0);
        let q = queue(store.clone(), authority.clone());

        let tenants = [TenantId::new(), TenantId::new()];
        for tenant in tenants {
            store
                .insert(RetryableOperation::transmit(tenant, "K", json!({})))
                .await
                .unwrap();
        }

        let summary = q.sweep_all().await.unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.accepted, 2);
        assert_eq!(authority.calls(), 2);
        assert!(store.tenants_with_open_work().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_sweeps_until_cancelled() {
        let store = InMemoryOperationStore::arc();
        let authority = ScriptedAuthority::arc(0);
        let q = Arc::new(ContingencyQueue::new(
            store.clone(),
            authority.clone(),
            QueueConfig::default().with_sweep_interval(Duration::from_secs(5)),
        ));

        let tenant = TenantId::new();
        store
            .insert(RetryableOperation::transmit(tenant, "K", json!({})))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(q.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(6)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(authority.calls(), 1);
        assert_eq!(
            store
                .fetch_open(tenant)
                .await
                .unwrap()
                .len(),
            0
        );
    }
}
