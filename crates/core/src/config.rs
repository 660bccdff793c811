//! Runtime configuration for the dispatch pipeline.
//!
//! Defaults mirror production values; `RuntimeConfig::from_env` overrides
//! them from `DTEFLOW_*` environment variables, warning and keeping the
//! default when a value does not parse.

use std::time::Duration;

/// Knobs consumed by the pipeline components.
///
/// The outbox retry ceiling and the contingency attempt ceiling are distinct
/// on purpose: the first caps wall-clock delay on an internal queue hand-off,
/// the second caps total attempts against the government API.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// TTL stamped on the dispatch lock key.
    pub lock_ttl: Duration,
    /// How long an acquire call keeps retrying before reporting contention.
    pub lock_max_wait: Duration,
    /// Sleep before the first acquire retry; grows by `lock_backoff_factor`.
    pub lock_retry_interval: Duration,
    /// Multiplier applied to the acquire retry sleep, capped at 1s.
    pub lock_backoff_factor: f64,
    /// Number of signer workers.
    pub pool_size: usize,
    /// Wall-clock budget for a single signing task.
    pub task_timeout: Duration,
    /// Events fetched per relay round.
    pub outbox_batch_size: usize,
    /// Cadence of the relay timer.
    pub outbox_poll_interval: Duration,
    /// Delivery retries before an event is dead-lettered.
    pub outbox_max_retries: u32,
    /// Authority attempts before an operation goes to `Error`.
    pub contingency_max_attempts: u32,
    /// Cadence of the contingency sweep.
    pub contingency_sweep_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_max_wait: Duration::from_secs(2),
            lock_retry_interval: Duration::from_millis(50),
            lock_backoff_factor: 2.0,
            pool_size: 4,
            task_timeout: Duration::from_secs(30),
            outbox_batch_size: 50,
            outbox_poll_interval: Duration::from_secs(10),
            outbox_max_retries: 5,
            contingency_max_attempts: 10,
            contingency_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = read_ms("DTEFLOW_LOCK_TTL_MS") {
            cfg.lock_ttl = v;
        }
        if let Some(v) = read_ms("DTEFLOW_LOCK_MAX_WAIT_MS") {
            cfg.lock_max_wait = v;
        }
        if let Some(v) = read_ms("DTEFLOW_LOCK_RETRY_INTERVAL_MS") {
            cfg.lock_retry_interval = v;
        }
        if let Some(v) = read_f64("DTEFLOW_LOCK_BACKOFF_FACTOR") {
            cfg.lock_backoff_factor = v;
        }
        if let Some(v) = read_usize("DTEFLOW_POOL_SIZE") {
            cfg.pool_size = v;
        }
        if let Some(v) = read_ms("DTEFLOW_TASK_TIMEOUT_MS") {
            cfg.task_timeout = v;
        }
        if let Some(v) = read_usize("DTEFLOW_OUTBOX_BATCH_SIZE") {
            cfg.outbox_batch_size = v;
        }
        if let Some(v) = read_ms("DTEFLOW_OUTBOX_POLL_INTERVAL_MS") {
            cfg.outbox_poll_interval = v;
        }
        if let Some(v) = read_u32("DTEFLOW_OUTBOX_MAX_RETRIES") {
            cfg.outbox_max_retries = v;
        }
        if let Some(v) = read_u32("DTEFLOW_CONTINGENCY_MAX_ATTEMPTS") {
            cfg.contingency_max_attempts = v;
        }
        if let Some(v) = read_ms("DTEFLOW_CONTINGENCY_SWEEP_INTERVAL_MS") {
            cfg.contingency_sweep_interval = v;
        }
        cfg
    }
}

fn read_ms(key: &str) -> Option<Duration> {
    std::env::var(key).ok().and_then(|raw| parse_ms(key, &raw))
}

fn read_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|raw| parse_u32(key, &raw))
}

fn read_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|raw| parse_usize(key, &raw))
}

fn read_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|raw| parse_f64(key, &raw))
}

fn parse_ms(key: &str, raw: &str) -> Option<Duration> {
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparseable duration; keeping default");
            None
        }
    }
}

fn parse_u32(key: &str, raw: &str) -> Option<u32> {
    match raw.parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparseable integer; keeping default");
            None
        }
    }
}

fn parse_usize(key: &str, raw: &str) -> Option<usize> {
    match raw.parse::<usize>() {
        Ok(v) if v > 0 => Some(v),
        Ok(_) => {
            tracing::warn!(key, raw, "value must be positive; keeping default");
            None
        }
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparseable integer; keeping default");
            None
        }
    }
}

fn parse_f64(key: &str, raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(v) if v >= 1.0 => Some(v),
        Ok(_) => {
            tracing::warn!(key, raw, "backoff factor below 1.0; keeping default");
            None
        }
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparseable float; keeping default");
            None
        }
    }
}
