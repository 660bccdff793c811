//! `dteflow-signing` — bounded worker pool for CPU-heavy document signing.
//!
//! Signing a DTE is blocking, CPU-bound work over certificate material that
//! must never run on the async scheduler. The pool keeps a fixed set of OS
//! worker threads behind a supervisor: tasks queue FIFO, each dispatched task
//! carries a wall-clock deadline, a worker that overruns or panics is
//! abandoned and replaced with a fresh one, and the secret material of every
//! task is zero-filled once the task settles, whatever the outcome.
//!
//! The signing algorithm itself is opaque to this crate; it enters through
//! the [`DocumentSigner`] trait.

pub mod metrics;
pub mod pool;
pub mod signer;
pub mod task;

pub use metrics::PoolMetricsSnapshot;
pub use pool::{SignJob, SignerPool, SignerPoolConfig};
pub use signer::DocumentSigner;
pub use task::{SignError, SignTask, SignedDocument};
