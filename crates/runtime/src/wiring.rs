//! Environment-selected store wiring.
//!
//! `USE_PERSISTENT_STORES=true` selects Redis for the lock and Postgres for
//! the backlogs; anything else wires the in-memory stacks (single-node dev
//! and tests). Multi-instance deployments must use the persistent stack —
//! the in-memory lock cannot exclude a second process.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use dteflow_contingency::{InMemoryOperationStore, OperationStore, PostgresOperationStore};
use dteflow_lock::{InMemoryLockStore, LockService};
use dteflow_outbox::{InMemoryOutboxStore, OutboxStore, PostgresOutboxStore};

#[cfg(feature = "redis")]
use dteflow_lock::RedisLockStore;

/// The durable collaborators the pipeline is built around.
pub struct PipelineStores {
    pub lock: LockService,
    pub outbox: Arc<dyn OutboxStore>,
    pub operations: Arc<dyn OperationStore>,
}

impl PipelineStores {
    /// All-in-memory stack.
    pub fn in_memory() -> Self {
        Self {
            lock: LockService::new(InMemoryLockStore::arc()),
            outbox: InMemoryOutboxStore::arc(),
            operations: InMemoryOperationStore::arc(),
        }
    }
}

/// Why the persistent stack could not be wired.
#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("DATABASE_URL must be set when USE_PERSISTENT_STORES is enabled")]
    MissingDatabaseUrl,

    #[error("failed to connect to Postgres: {0}")]
    Postgres(String),

    #[error("failed to build the Redis lock store: {0}")]
    Redis(String),

    #[error("persistent stores require building with the `redis` feature")]
    RedisFeatureDisabled,
}

/// Build the store stack selected by `USE_PERSISTENT_STORES`.
pub async fn stores_from_env() -> Result<PipelineStores, WiringError> {
    if !use_persistent_stores() {
        info!("wiring in-memory stores (single-instance mode)");
        return Ok(PipelineStores::in_memory());
    }

    let database_url = std::env::var("DATABASE_URL").map_err(|_| WiringError::MissingDatabaseUrl)?;
    let pool = PgPool::connect(&database_url)
        .await
        .map_err(|e| WiringError::Postgres(e.to_string()))?;
    info!("wiring Postgres-backed outbox and operation stores");

    Ok(PipelineStores {
        lock: redis_lock_service()?,
        outbox: Arc::new(PostgresOutboxStore::new(pool.clone())),
        operations: Arc::new(PostgresOperationStore::new(pool)),
    })
}

fn use_persistent_stores() -> bool {
    match std::env::var("USE_PERSISTENT_STORES") {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" | "" => false,
            other => {
                warn!(raw = other, "unparseable USE_PERSISTENT_STORES, defaulting to in-memory");
                false
            }
        },
        Err(_) => false,
    }
}

#[cfg(feature = "redis")]
fn redis_lock_service() -> Result<LockService, WiringError> {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let store = RedisLockStore::new(&redis_url, None).map_err(|e| WiringError::Redis(e.to_string()))?;
    info!("wiring Redis-backed lock store");
    Ok(LockService::new(Arc::new(store)))
}

#[cfg(not(feature = "redis"))]
fn redis_lock_service() -> Result<LockService, WiringError> {
    Err(WiringError::RedisFeatureDisabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_flag_parses_leniently() {
        // Exercises only the parser; env-dependent wiring is covered by
        // deployment smoke tests.
        for (raw, expected) in [
            ("true", true),
            ("1", true),
            ("YES", true),
            ("false", false),
            ("0", false),
            ("banana", false),
        ] {
            // SAFETY: tests in this module run on one thread per process
            // invocation and no other test reads this variable.
            unsafe { std::env::set_var("USE_PERSISTENT_STORES", raw) };
            assert_eq!(use_persistent_stores(), expected, "raw = {raw}");
        }
        unsafe { std::env::remove_var("USE_PERSISTENT_STORES") };
    }
}
