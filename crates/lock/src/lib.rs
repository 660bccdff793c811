//! `dteflow-lock` — distributed mutual exclusion for the dispatch loop.
//!
//! Any number of server instances may run the outbox relay; only the one
//! holding the `outbox:processing` lock processes a round. The lock lives in
//! a shared key-value store ([`LockStore`]) offering four atomic primitives:
//! set-if-absent-with-expiry, get, compare-and-delete, compare-and-expire.
//! [`LockService`] layers acquisition retry with backoff, owner tokens, and
//! optional background renewal on top of whichever store is wired in.
//!
//! Crash tolerance comes from the TTL: a holder that dies without releasing
//! simply lets the key expire, and another instance picks the lock up within
//! one TTL.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_lock;
pub mod service;
pub mod store;

pub use memory::InMemoryLockStore;
#[cfg(feature = "redis")]
pub use redis_lock::RedisLockStore;
pub use service::{AcquireOptions, LockAcquisition, LockGuard, LockService};
pub use store::{LockStore, LockStoreError};
