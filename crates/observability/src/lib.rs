//! `dteflow-observability` — process-wide tracing setup.
//!
//! The pipeline logs structured events only (`tracing` with fields); this
//! crate installs the subscriber that renders them.

pub mod tracing;

pub use tracing::init;
