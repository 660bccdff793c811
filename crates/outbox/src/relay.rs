//! The lock-guarded relay loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dteflow_lock::{AcquireOptions, LockAcquisition, LockGuard, LockService};

use crate::backoff::RetryBackoff;
use crate::event::{EventStatus, OutboxEvent};
use crate::publisher::{PublishError, PublisherRegistry};
use crate::store::{OutboxStore, OutboxStoreError};

/// Relay construction knobs; defaults are the production constants.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Key of the cross-instance dispatch lock.
    pub lock_key: String,
    /// Events fetched per round.
    pub batch_size: usize,
    /// Cadence of the timer loop.
    pub poll_interval: Duration,
    /// Failed attempts before an event is dead-lettered.
    pub max_retries: u32,
    /// Reschedule delays.
    pub backoff: RetryBackoff,
    /// TTL stamped on the dispatch lock.
    pub lock_ttl: Duration,
    /// How long one round waits for the lock before skipping.
    pub lock_max_wait: Duration,
    /// Sleep after the first failed acquire attempt.
    pub lock_retry_interval: Duration,
    /// Multiplier for the acquire retry sleep.
    pub lock_backoff_factor: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lock_key: "outbox:processing".to_string(),
            batch_size: 50,
            poll_interval: Duration::from_secs(10),
            max_retries: 5,
            backoff: RetryBackoff::default(),
            lock_ttl: Duration::from_secs(30),
            lock_max_wait: Duration::from_secs(2),
            lock_retry_interval: Duration::from_millis(50),
            lock_backoff_factor: 2.0,
        }
    }
}

impl RelayConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_lock_max_wait(mut self, lock_max_wait: Duration) -> Self {
        self.lock_max_wait = lock_max_wait;
        self
    }

    pub fn with_lock_retry_interval(mut self, lock_retry_interval: Duration) -> Self {
        self.lock_retry_interval = lock_retry_interval;
        self
    }

    pub fn with_lock_backoff_factor(mut self, lock_backoff_factor: f64) -> Self {
        self.lock_backoff_factor = lock_backoff_factor;
        self
    }
}

/// Terminal error of the manual relay operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// The dispatch lock could not be taken (contended or store down).
    #[error("dispatch lock unavailable: {0}")]
    LockUnavailable(String),

    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// What one round (or replay) did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    /// Events picked up from the backlog.
    pub fetched: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// The round was cut short because lock ownership was lost mid-batch.
    pub lock_lost: bool,
}

/// Outcome of a single timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// This instance owned the round.
    Processed(DeliverySummary),
    /// Another instance owns the round, or the lock store is down.
    Skipped,
}

#[derive(Debug, Default)]
struct RelayStats {
    rounds: AtomicU64,
    skipped_ticks: AtomicU64,
    sent: AtomicU64,
    rescheduled: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time relay counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RelayStatsSnapshot {
    pub rounds: u64,
    pub skipped_ticks: u64,
    pub sent: u64,
    pub rescheduled: u64,
    pub dead_lettered: u64,
}

/// Polls the durable backlog and forwards ready events downstream.
///
/// Any number of relay instances may share one backlog; the distributed
/// lock guarantees that only one of them processes a given round, so no two
/// instances ever deliver overlapping batches.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publishers: PublisherRegistry,
    lock: LockService,
    config: RelayConfig,
    stats: RelayStats,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publishers: PublisherRegistry,
        lock: LockService,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            publishers,
            lock,
            config,
            stats: RelayStats::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            rounds: self.stats.rounds.load(Ordering::Relaxed),
            skipped_ticks: self.stats.skipped_ticks.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            rescheduled: self.stats.rescheduled.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Drive the relay on its timer until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            lock_key = %self.config.lock_key,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox relay started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
            self.tick().await;
        }
        info!("outbox relay stopped");
    }

    /// Run one round: take the lock, process a batch, release the lock.
    ///
    /// Contention and lock-store unavailability are normal skips, never
    /// errors; the events stay `Pending` in durable storage.
    pub async fn tick(&self) -> RoundOutcome {
        let guard = match self.lock.acquire(&self.config.lock_key, self.acquire_options()).await {
            LockAcquisition::Acquired(guard) => guard,
            LockAcquisition::Contended => {
                debug!(lock_key = %self.config.lock_key, "relay tick skipped, lock contended");
                self.stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                return RoundOutcome::Skipped;
            }
            LockAcquisition::Unavailable { reason } => {
                warn!(lock_key = %self.config.lock_key, %reason, "relay tick skipped, lock store unavailable");
                self.stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                return RoundOutcome::Skipped;
            }
        };

        self.stats.rounds.fetch_add(1, Ordering::Relaxed);
        let batch = self
            .store
            .fetch_ready(Utc::now(), self.config.batch_size)
            .await;
        let summary = match batch {
            Ok(events) => self.process_events(events, &guard).await,
            Err(e) => {
                warn!(error = %e, "relay round aborted, backlog fetch failed");
                DeliverySummary::default()
            }
        };

        // The lock is released whatever happened to the batch.
        self.lock.release(guard).await;
        self.record(&summary);
        RoundOutcome::Processed(summary)
    }

    /// Re-deliver every pending event created at or before `until`, ignoring
    /// `available_at`. Manual disaster recovery: bypasses the timer but
    /// still runs under the dispatch lock.
    pub async fn replay(&self, until: DateTime<Utc>) -> Result<DeliverySummary, OutboxError> {
        let guard = match self.lock.acquire(&self.config.lock_key, self.acquire_options()).await {
            LockAcquisition::Acquired(guard) => guard,
            LockAcquisition::Contended => {
                return Err(OutboxError::LockUnavailable(
                    "another instance holds the dispatch lock".to_string(),
                ));
            }
            LockAcquisition::Unavailable { reason } => {
                return Err(OutboxError::LockUnavailable(reason));
            }
        };

        let backlog = self.store.fetch_pending_until(until).await;
        let result = match backlog {
            Ok(events) => {
                info!(count = events.len(), %until, "replaying pending backlog");
                Ok(self.process_events(events, &guard).await)
            }
            Err(e) => Err(OutboxError::from(e)),
        };

        self.lock.release(guard).await;
        if let Ok(summary) = &result {
            self.record(summary);
        }
        result
    }

    async fn process_events(
        &self,
        events: Vec<OutboxEvent>,
        guard: &LockGuard,
    ) -> DeliverySummary {
        let mut summary = DeliverySummary {
            fetched: events.len(),
            ..DeliverySummary::default()
        };

        for mut event in events {
            // Another instance may own the key once our TTL lapses; stop
            // before delivering under a lock we no longer hold.
            if guard.is_lost() {
                warn!(lock_key = %guard.key(), "lock ownership lost mid-batch, aborting round");
                summary.lock_lost = true;
                break;
            }
            self.deliver(&mut event, &mut summary).await;
        }
        summary
    }

    async fn deliver(&self, event: &mut OutboxEvent, summary: &mut DeliverySummary) {
        let transition = match self.publishers.dispatch(event).await {
            Ok(()) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "outbox event delivered");
                summary.sent += 1;
                event.mark_sent()
            }
            Err(PublishError::Unroutable(reason)) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    %reason,
                    "outbox event unroutable, dead-lettered"
                );
                summary.dead_lettered += 1;
                event.mark_unroutable(reason)
            }
            Err(PublishError::Transient(reason)) => {
                let result = event.mark_delivery_failed(
                    reason.as_str(),
                    &self.config.backoff,
                    self.config.max_retries,
                );
                if event.status == EventStatus::Failed {
                    warn!(
                        event_id = %event.id,
                        retries = event.retries,
                        %reason,
                        "outbox event exhausted retries, dead-lettered"
                    );
                    summary.dead_lettered += 1;
                } else {
                    debug!(
                        event_id = %event.id,
                        retries = event.retries,
                        available_at = %event.available_at,
                        %reason,
                        "outbox event rescheduled"
                    );
                    summary.rescheduled += 1;
                }
                result
            }
        };

        if let Err(e) = transition {
            warn!(event_id = %event.id, error = %e, "illegal outbox transition skipped");
            return;
        }
        if let Err(e) = self.store.update(event).await {
            // The event stays in its previous durable state and will be
            // picked up again; at-least-once, not exactly-once.
            warn!(event_id = %event.id, error = %e, "failed to persist outbox transition");
        }
    }

    fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions::default()
            .with_ttl(self.config.lock_ttl)
            .with_max_wait(self.config.lock_max_wait)
            .with_retry_interval(self.config.lock_retry_interval)
            .with_backoff_factor(self.config.lock_backoff_factor)
            .with_auto_renew(true)
    }

    fn record(&self, summary: &DeliverySummary) {
        self.stats.sent.fetch_add(summary.sent as u64, Ordering::Relaxed);
        self.stats
            .rescheduled
            .fetch_add(summary.rescheduled as u64, Ordering::Relaxed);
        self.stats
            .dead_lettered
            .fetch_add(summary.dead_lettered as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, far_future};
    use crate::memory::InMemoryOutboxStore;
    use crate::publisher::EventPublisher;
    use dteflow_core::TenantId;
    use dteflow_lock::{InMemoryLockStore, LockStore};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Counts deliveries; fails the first `failures` calls transiently.
    struct FlakyPublisher {
        failures: AtomicUsize,
        delivered: AtomicUsize,
    }

    impl FlakyPublisher {
        fn arc(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                delivered: AtomicUsize::new(0),
            })
        }

        fn delivered(&self) -> usize {
            self.delivered.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, _event: &OutboxEvent) -> Result<(), PublishError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PublishError::transient("downstream queue refused"));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sign_type() -> EventType {
        EventType::new("dte.sign").unwrap()
    }

    fn relay_with(
        lock_store: Arc<InMemoryLockStore>,
        store: Arc<InMemoryOutboxStore>,
        publisher: Arc<FlakyPublisher>,
    ) -> OutboxRelay {
        OutboxRelay::new(
            store,
            PublisherRegistry::new().register(sign_type(), publisher),
            LockService::new(lock_store),
            RelayConfig::default().with_lock_max_wait(Duration::from_millis(100)),
        )
    }

    fn pending_event(event_type: EventType) -> OutboxEvent {
        OutboxEvent::new(TenantId::new(), event_type, json!({"doc": "DTE-01"}))
    }

    /// Force an event back onto the ready queue without waiting wall-clock
    /// time for its backoff.
    async fn make_ready(store: &InMemoryOutboxStore, id: dteflow_core::EventId) {
        let mut event = store.get(id).await.unwrap().unwrap();
        event.available_at = Utc::now() - chrono::Duration::seconds(1);
        store.update(&event).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn round_delivers_and_marks_sent() {
        let store = InMemoryOutboxStore::arc();
        let publisher = FlakyPublisher::arc(0);
        let relay = relay_with(InMemoryLockStore::arc(), store.clone(), publisher.clone());

        let id = store.insert(pending_event(sign_type())).await.unwrap();
        let outcome = relay.tick().await;

        assert_eq!(
            outcome,
            RoundOutcome::Processed(DeliverySummary {
                fetched: 1,
                sent: 1,
                ..DeliverySummary::default()
            })
        );
        assert_eq!(publisher.delivered(), 1);
        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Sent);
        assert_eq!(relay.stats().sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_reschedules_with_backoff() {
        let store = InMemoryOutboxStore::arc();
        let relay = relay_with(InMemoryLockStore::arc(), store.clone(), FlakyPublisher::arc(1));

        let id = store.insert(pending_event(sign_type())).await.unwrap();
        relay.tick().await;

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retries, 1);
        assert!(!event.is_ready(Utc::now()));
        assert_eq!(relay.stats().rescheduled, 1);

        // A second immediate round must not pick it up.
        let outcome = relay.tick().await;
        assert_eq!(
            outcome,
            RoundOutcome::Processed(DeliverySummary::default())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_dead_letter_the_event() {
        let store = InMemoryOutboxStore::arc();
        let relay = relay_with(InMemoryLockStore::arc(), store.clone(), FlakyPublisher::arc(usize::MAX));

        let id = store.insert(pending_event(sign_type())).await.unwrap();
        for _ in 0..5 {
            relay.tick().await;
            if store.get(id).await.unwrap().unwrap().status == EventStatus::Pending {
                make_ready(&store, id).await;
            }
        }

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.retries, 5);
        assert_eq!(event.available_at, far_future());
        assert_eq!(relay.stats().dead_lettered, 1);
        assert_eq!(relay.stats().rescheduled, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_type_fails_permanently() {
        let store = InMemoryOutboxStore::arc();
        let publisher = FlakyPublisher::arc(0);
        let relay = relay_with(InMemoryLockStore::arc(), store.clone(), publisher.clone());

        let id = store
            .insert(pending_event(EventType::new("legacy.export").unwrap()))
            .await
            .unwrap();
        relay.tick().await;

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.retries, 0);
        assert_eq!(publisher.delivered(), 0);
        assert_eq!(relay.stats().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn racing_instances_process_each_round_once() {
        let lock_store = InMemoryLockStore::arc();
        let store = InMemoryOutboxStore::arc();
        let publisher = FlakyPublisher::arc(0);

        for _ in 0..3 {
            store.insert(pending_event(sign_type())).await.unwrap();
        }

        let mut instances = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let relay = Arc::new(relay_with(
                lock_store.clone(),
                store.clone(),
                publisher.clone(),
            ));
            instances.spawn(async move { relay.tick().await });
        }

        // Exactly one instance performed the batch's side effects; the
        // others either skipped or found an empty backlog.
        let mut batches_with_work = 0;
        while let Some(outcome) = instances.join_next().await {
            if matches!(outcome.unwrap(), RoundOutcome::Processed(s) if s.fetched > 0) {
                batches_with_work += 1;
            }
        }
        assert_eq!(batches_with_work, 1);
        assert_eq!(publisher.delivered(), 3);
        assert_eq!(store.counts().await.unwrap().sent, 3);
    }

    /// Delivers its first event only after stealing the dispatch lock and
    /// letting the holder's renewal observe the loss.
    struct LockStealingPublisher {
        lock_store: Arc<InMemoryLockStore>,
        stolen: AtomicBool,
        delivered: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventPublisher for LockStealingPublisher {
        async fn publish(&self, _event: &OutboxEvent) -> Result<(), PublishError> {
            if !self.stolen.swap(true, Ordering::SeqCst) {
                let key = "outbox:processing";
                let token = self.lock_store.holder(key).await.unwrap().unwrap();
                self.lock_store.release_if_held(key, &token).await.unwrap();
                self.lock_store
                    .try_set(key, "intruder", Duration::from_secs(60))
                    .await
                    .unwrap();
                // Give the renewal tick time to run and flag the loss.
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_ownership_aborts_the_round_mid_batch() {
        let lock_store = InMemoryLockStore::arc();
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(LockStealingPublisher {
            lock_store: lock_store.clone(),
            stolen: AtomicBool::new(false),
            delivered: AtomicUsize::new(0),
        });

        let relay = OutboxRelay::new(
            store.clone(),
            PublisherRegistry::new().register(sign_type(), publisher.clone()),
            LockService::new(lock_store.clone()),
            RelayConfig::default()
                .with_lock_ttl(Duration::from_millis(200))
                .with_lock_max_wait(Duration::from_millis(50)),
        );

        for _ in 0..3 {
            store.insert(pending_event(sign_type())).await.unwrap();
        }

        let RoundOutcome::Processed(summary) = relay.tick().await else {
            panic!("round never started; the lock was free");
        };

        assert!(summary.lock_lost);
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.sent, 1);
        assert_eq!(publisher.delivered.load(Ordering::SeqCst), 1);

        // The untouched events stay pending for the next holder, and the
        // intruder keeps the key.
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.pending, 2);
        assert_eq!(
            lock_store.holder("outbox:processing").await.unwrap().as_deref(),
            Some("intruder")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_released_after_the_round() {
        let lock_store = InMemoryLockStore::arc();
        let store = InMemoryOutboxStore::arc();
        let relay = relay_with(lock_store.clone(), store.clone(), FlakyPublisher::arc(0));

        store.insert(pending_event(sign_type())).await.unwrap();
        relay.tick().await;

        assert_eq!(lock_store.holder("outbox:processing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_delivers_backlog_not_yet_eligible() {
        let store = InMemoryOutboxStore::arc();
        let publisher = FlakyPublisher::arc(0);
        let relay = relay_with(InMemoryLockStore::arc(), store.clone(), publisher.clone());

        let mut deferred = pending_event(sign_type());
        deferred.available_at = Utc::now() + chrono::Duration::hours(2);
        let id = store.insert(deferred).await.unwrap();

        // The timer path leaves it alone.
        relay.tick().await;
        assert_eq!(publisher.delivered(), 0);

        let summary = relay.replay(Utc::now()).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(publisher.delivered(), 1);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            EventStatus::Sent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replay_requires_the_lock() {
        let lock_store = InMemoryLockStore::arc();
        let store = InMemoryOutboxStore::arc();
        let relay = relay_with(lock_store.clone(), store, FlakyPublisher::arc(0));

        // Another instance holds the key for longer than the max wait.
        lock_store
            .try_set("outbox:processing", "other-instance", Duration::from_secs(60))
            .await
            .unwrap();

        let err = relay.replay(Utc::now()).await.unwrap_err();
        assert!(matches!(err, OutboxError::LockUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_ticks_until_cancelled() {
        let store = InMemoryOutboxStore::arc();
        let publisher = FlakyPublisher::arc(0);
        let relay = Arc::new(relay_with(
            InMemoryLockStore::arc(),
            store.clone(),
            publisher.clone(),
        ));

        store.insert(pending_event(sign_type())).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(relay.clone().run(shutdown.clone()));

        // One poll interval passes in paused time.
        tokio::time::sleep(Duration::from_secs(11)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(publisher.delivered(), 1);
        assert!(relay.stats().rounds >= 1);
    }

    struct OrderedPublisher {
        seen: Mutex<Vec<dteflow_core::EventId>>,
    }

    #[async_trait::async_trait]
    impl EventPublisher for OrderedPublisher {
        async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
            self.seen.lock().unwrap().push(event.id);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_processed_in_creation_order() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(OrderedPublisher {
            seen: Mutex::new(Vec::new()),
        });
        let relay = OutboxRelay::new(
            store.clone(),
            PublisherRegistry::new().register(sign_type(), publisher.clone()),
            LockService::new(InMemoryLockStore::arc()),
            RelayConfig::default(),
        );

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(store.insert(pending_event(sign_type())).await.unwrap());
        }
        relay.tick().await;

        assert_eq!(*publisher.seen.lock().unwrap(), ids);
    }
}
