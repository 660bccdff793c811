//! Pool counters, updated by the supervisor, readable from anywhere.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Shared counters behind the pool's `metrics()` view.
#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub rejected: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub active_workers: AtomicUsize,
    pub queued_tasks: AtomicUsize,
}

impl PoolMetrics {
    pub fn record_completion(&self, latency_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self, latency_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_timeout(&self, latency_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_gauges(&self, active: usize, queued: usize) {
        self.active_workers.store(active, Ordering::Relaxed);
        self.queued_tasks.store(queued, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pool_size: usize) -> PoolMetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let settled = completed + failed;
        let total_latency_ms = self.total_latency_ms.load(Ordering::Relaxed);
        let active = self.active_workers.load(Ordering::Relaxed);

        PoolMetricsSnapshot {
            total_tasks: self.submitted.load(Ordering::Relaxed),
            completed_tasks: completed,
            failed_tasks: failed,
            timed_out_tasks: self.timed_out.load(Ordering::Relaxed),
            rejected_tasks: self.rejected.load(Ordering::Relaxed),
            average_latency_ms: if settled == 0 { 0 } else { total_latency_ms / settled },
            active_workers: active,
            idle_workers: pool_size.saturating_sub(active),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolMetricsSnapshot {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub timed_out_tasks: u64,
    pub rejected_tasks: u64,
    pub average_latency_ms: u64,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
}
