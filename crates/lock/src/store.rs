//! Storage seam for the distributed lock.

use std::time::Duration;

/// Error from the lock's backing store.
///
/// The service never propagates these to its callers; they turn into
/// "not acquired" outcomes plus a log line.
#[derive(Debug, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock store connection error: {0}")]
    Connection(String),

    #[error("lock store command error: {0}")]
    Command(String),
}

impl LockStoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

/// The four atomic primitives the lock needs from a shared key-value store.
///
/// Every operation that mutates state is conditional on the stored owner
/// token, so a stale holder can never clobber a lock that expired and was
/// reacquired by someone else.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Store `token` under `key` with the given expiry, only if `key` is
    /// currently absent. Returns whether the write happened.
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Current owner token for `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>, LockStoreError>;

    /// Delete `key` only if its value equals `token`. Returns whether a
    /// deletion happened.
    async fn release_if_held(&self, key: &str, token: &str) -> Result<bool, LockStoreError>;

    /// Reset the expiry of `key` to `ttl` only if its value equals `token`.
    /// Returns whether the extension happened.
    async fn extend_if_held(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError>;
}
