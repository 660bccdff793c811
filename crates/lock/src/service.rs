//! Lock acquisition, release, and background renewal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::LockStore;

/// Acquisition retry sleeps never grow past this, whatever the factor.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Renewal runs at this fraction of the TTL so an extension lands well
/// before the key can expire.
const RENEW_FRACTION: f64 = 0.8;

/// Parameters for a single acquisition attempt.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Expiry stamped on the key; the crash-recovery bound.
    pub ttl: Duration,
    /// Total time budget for the retry loop before reporting contention.
    pub max_wait: Duration,
    /// Sleep after the first failed attempt; grows by `backoff_factor`.
    pub retry_interval: Duration,
    /// Multiplier for the retry sleep, capped at 1s.
    pub backoff_factor: f64,
    /// Spawn a background task that keeps extending the TTL while held.
    pub auto_renew: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_wait: Duration::from_secs(2),
            retry_interval: Duration::from_millis(50),
            backoff_factor: 2.0,
            auto_renew: false,
        }
    }
}

impl AcquireOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }
}

/// Outcome of an acquisition attempt.
///
/// Contention and store unavailability are ordinary outcomes, not errors;
/// the relay treats both as "skip this round".
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(LockGuard),
    /// Someone else held the key for the whole `max_wait` window.
    Contended,
    /// The backing store could not be reached.
    Unavailable { reason: String },
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn into_guard(self) -> Option<LockGuard> {
        match self {
            Self::Acquired(guard) => Some(guard),
            _ => None,
        }
    }
}

/// Proof of holding a named lock.
///
/// Dropping a guard without releasing stops the renewal task and leaves the
/// key to its TTL; that is the crash path, and it is safe because every
/// store mutation is conditional on the owner token.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    token: String,
    ttl: Duration,
    acquired_at: Instant,
    lost: Arc<AtomicBool>,
    renewal: Option<CancellationToken>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Whether the renewal task observed that ownership was lost.
    ///
    /// Callers doing critical work under the lock must check this (or
    /// [`LockService::is_still_held`]) before trusting their side effects.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn stop_renewal(&self) {
        if let Some(token) = &self.renewal {
            token.cancel();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

/// Distributed mutual exclusion over any [`LockStore`].
///
/// One instance per process; cloning shares the store handle.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn LockStore>,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Try to take `key` for `opts.ttl`, retrying with growing sleeps until
    /// `opts.max_wait` is spent.
    ///
    /// Never returns an error: contention and store failure are reported as
    /// [`LockAcquisition`] variants.
    pub async fn acquire(&self, key: &str, opts: AcquireOptions) -> LockAcquisition {
        let token = Uuid::now_v7().to_string();
        let started = Instant::now();
        let mut retry_interval = opts.retry_interval;

        loop {
            match self.store.try_set(key, &token, opts.ttl).await {
                Ok(true) => {
                    debug!(key, token = %token, "lock acquired");
                    return LockAcquisition::Acquired(self.build_guard(key, token, &opts));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(key, error = %e, "lock store unavailable, reporting not acquired");
                    return LockAcquisition::Unavailable {
                        reason: e.to_string(),
                    };
                }
            }

            if started.elapsed() + retry_interval > opts.max_wait {
                debug!(key, "lock contended for the whole max_wait window");
                return LockAcquisition::Contended;
            }
            tokio::time::sleep(retry_interval).await;
            retry_interval = grow_interval(retry_interval, opts.backoff_factor);
        }
    }

    /// Release `guard`, deleting the key only if this token still owns it.
    ///
    /// Returns false when ownership had already moved on (expiry plus
    /// reacquisition by another instance) or the store is unreachable.
    pub async fn release(&self, guard: LockGuard) -> bool {
        guard.stop_renewal();
        match self.store.release_if_held(&guard.key, &guard.token).await {
            Ok(true) => {
                debug!(key = %guard.key, "lock released");
                true
            }
            Ok(false) => {
                warn!(key = %guard.key, "release skipped, token no longer owns the lock");
                false
            }
            Err(e) => {
                warn!(key = %guard.key, error = %e, "release failed, key will expire on its own");
                false
            }
        }
    }

    /// Re-check the store for ownership. Combines the renewal task's verdict
    /// with a live read, for callers about to commit critical work.
    pub async fn is_still_held(&self, guard: &LockGuard) -> bool {
        if guard.is_lost() {
            return false;
        }
        matches!(
            self.store.holder(&guard.key).await,
            Ok(Some(current)) if current == guard.token
        )
    }

    fn build_guard(&self, key: &str, token: String, opts: &AcquireOptions) -> LockGuard {
        let lost = Arc::new(AtomicBool::new(false));
        let renewal = opts.auto_renew.then(|| {
            let cancel = CancellationToken::new();
            tokio::spawn(renewal_loop(
                Arc::clone(&self.store),
                key.to_string(),
                token.clone(),
                opts.ttl,
                Arc::clone(&lost),
                cancel.clone(),
            ));
            cancel
        });

        LockGuard {
            key: key.to_string(),
            token,
            ttl: opts.ttl,
            acquired_at: Instant::now(),
            lost,
            renewal,
        }
    }
}

fn grow_interval(current: Duration, factor: f64) -> Duration {
    let grown = Duration::from_secs_f64(current.as_secs_f64() * factor.max(1.0));
    grown.min(MAX_RETRY_INTERVAL)
}

/// Extend the TTL at a fraction of its length while ownership holds.
///
/// Extension is conditional on the stored token; when it reports false the
/// key expired and moved on, so the loop flags the loss and stops. Store
/// errors are retried on the next tick, expiry itself is the backstop.
async fn renewal_loop(
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let tick = ttl.mul_f64(RENEW_FRACTION);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = cancel.cancelled() => return,
        }

        match store.extend_if_held(&key, &token, ttl).await {
            Ok(true) => {
                debug!(key = %key, "lock ttl extended");
            }
            Ok(false) => {
                warn!(key = %key, "lock ownership lost, renewal stopped");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "lock renewal attempt failed, will retry");
            }
        }
    }
}
