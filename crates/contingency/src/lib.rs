//! `dteflow-contingency` — bounded-attempt retries against the tax authority.
//!
//! When the authority's API is unreachable, transmit and invalidate
//! requests are queued as durable [`RetryableOperation`] records and swept
//! periodically. Unlike the outbox relay's exponential model, this queue
//! applies no in-process backoff: cadence comes from the caller's sweep
//! interval, and business policy caps total attempts (default 10) rather
//! than wall-clock delay.

pub mod authority;
pub mod memory;
pub mod operation;
pub mod postgres;
pub mod queue;
pub mod store;

pub use authority::{AuthorityClient, AuthorityError, AuthorityReceipt};
pub use memory::InMemoryOperationStore;
pub use operation::{OperationKind, OperationStatus, RetryableOperation};
pub use postgres::PostgresOperationStore;
pub use queue::{ContingencyError, ContingencyQueue, QueueConfig, SweepSummary};
pub use store::{OperationStore, OperationStoreError};
