//! Redis-backed lock store.
//!
//! All four primitives are single round trips and atomic on the server:
//! - set-if-absent-with-expiry: `SET key token NX PX ttl`
//! - ownership check: `GET key`
//! - compare-and-delete / compare-and-expire: Lua scripts, since Redis has
//!   no native conditional DEL/PEXPIRE on value.
//!
//! Expiry is enforced by Redis itself, which is what makes a crashed holder
//! recoverable without any coordination.

use std::sync::Arc;
use std::time::Duration;

use redis::Script;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use crate::store::{LockStore, LockStoreError};

/// Namespace for lock keys so they cannot collide with other users of the
/// same Redis instance.
const DEFAULT_KEY_PREFIX: &str = "dteflow:lock:";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end"#;

pub struct RedisLockStore {
    client: Arc<redis::Client>,
    key_prefix: String,
    /// Cached multiplexed connection; dropped on connection-level failure so
    /// the next call redials.
    conn: Mutex<Option<MultiplexedConnection>>,
    release_script: Script,
    extend_script: Script,
}

impl RedisLockStore {
    /// Create a store against `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// Connecting is lazy; a Redis that is down at startup only surfaces
    /// when the first operation runs.
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: Option<String>,
    ) -> Result<Self, LockStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockStoreError::connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            conn: Mutex::new(None),
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockStoreError> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockStoreError::connection(e.to_string()))?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn command_failed(&self, what: &str, e: redis::RedisError) -> LockStoreError {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            *self.conn.lock().await = None;
            LockStoreError::connection(format!("{what}: {e}"))
        } else {
            LockStoreError::command(format!("{what}: {e}"))
        }
    }
}

#[async_trait::async_trait]
impl LockStore for RedisLockStore {
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let outcome: Result<Option<String>, _> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await;

        match outcome {
            Ok(reply) => Ok(reply.is_some()),
            Err(e) => Err(self.command_failed("SET NX PX", e).await),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockStoreError> {
        let mut conn = self.connection().await?;

        let value: Result<Option<String>, _> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await;

        match value {
            Ok(v) => Ok(v),
            Err(e) => Err(self.command_failed("GET", e).await),
        }
    }

    async fn release_if_held(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let mut conn = self.connection().await?;

        let deleted: Result<i64, _> = self
            .release_script
            .key(self.namespaced(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await;

        match deleted {
            Ok(n) => Ok(n == 1),
            Err(e) => Err(self.command_failed("release script", e).await),
        }
    }

    async fn extend_if_held(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let extended: Result<i64, _> = self
            .extend_script
            .key(self.namespaced(key))
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await;

        match extended {
            Ok(n) => Ok(n == 1),
            Err(e) => Err(self.command_failed("extend script", e).await),
        }
    }
}
