//! The pipeline service object and its lifecycle.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dteflow_contingency::{AuthorityClient, ContingencyQueue, QueueConfig};
use dteflow_core::RuntimeConfig;
use dteflow_outbox::{OutboxRelay, PublisherRegistry, RelayConfig, RetryBackoff};
use dteflow_signing::{DocumentSigner, SignerPool, SignerPoolConfig};

use crate::wiring::PipelineStores;

/// External collaborators the pipeline consumes but does not implement.
pub struct PipelineServices {
    pub publishers: PublisherRegistry,
    pub authority: Arc<dyn AuthorityClient>,
    pub signer: Arc<dyn DocumentSigner>,
}

/// The dispatch pipeline as one explicitly constructed service object.
///
/// Owns the outbox relay, the contingency queue, and the signer pool.
/// `start` spawns the periodic loops; `shutdown` cancels them, waits for
/// the current round to finish (the relay releases its lock in its own
/// cleanup path), and stops the pool. Construction does no I/O.
pub struct DispatchPipeline {
    relay: Arc<OutboxRelay>,
    queue: Arc<ContingencyQueue>,
    pool: Arc<SignerPool>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPipeline {
    pub fn new(config: RuntimeConfig, stores: PipelineStores, services: PipelineServices) -> Self {
        let relay_config = RelayConfig::default()
            .with_batch_size(config.outbox_batch_size)
            .with_poll_interval(config.outbox_poll_interval)
            .with_max_retries(config.outbox_max_retries)
            .with_backoff(RetryBackoff::default())
            .with_lock_ttl(config.lock_ttl)
            .with_lock_max_wait(config.lock_max_wait)
            .with_lock_retry_interval(config.lock_retry_interval)
            .with_lock_backoff_factor(config.lock_backoff_factor);
        let relay = Arc::new(OutboxRelay::new(
            stores.outbox,
            services.publishers,
            stores.lock,
            relay_config,
        ));

        let queue = Arc::new(ContingencyQueue::new(
            stores.operations,
            services.authority,
            QueueConfig::default()
                .with_max_attempts(config.contingency_max_attempts)
                .with_sweep_interval(config.contingency_sweep_interval),
        ));

        let pool = Arc::new(SignerPool::new(
            services.signer,
            SignerPoolConfig::default()
                .with_size(config.pool_size)
                .with_task_timeout(config.task_timeout),
        ));

        Self {
            relay,
            queue,
            pool,
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// The relay, for manual `replay` and stats.
    pub fn relay(&self) -> &Arc<OutboxRelay> {
        &self.relay
    }

    /// The contingency queue, for manual sweeps and triage.
    pub fn queue(&self) -> &Arc<ContingencyQueue> {
        &self.queue
    }

    /// The signer pool; callers submit [`dteflow_signing::SignTask`]s here.
    pub fn signer_pool(&self) -> &Arc<SignerPool> {
        &self.pool
    }

    /// Spawn the relay loop and the contingency sweep loop. Idempotent:
    /// calling twice does not double the loops.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            warn!("pipeline already started, ignoring");
            return;
        }
        loops.push(tokio::spawn(
            self.relay.clone().run(self.shutdown.child_token()),
        ));
        loops.push(tokio::spawn(
            self.queue.clone().run(self.shutdown.child_token()),
        ));
        info!("dispatch pipeline started");
    }

    /// Stop the loops and the pool. The current relay round finishes and
    /// releases the dispatch lock through its normal cleanup; queued
    /// signing tasks are rejected with their material wiped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "pipeline loop ended abnormally");
            }
        }
        self.pool.shutdown();
        info!("dispatch pipeline stopped");
    }
}
