//! `dteflow-core` — shared primitives for the dispatch pipeline.
//!
//! Identifier newtypes, the domain error model, and the environment-driven
//! runtime configuration. No infrastructure concerns live here.

pub mod config;
pub mod error;
pub mod id;

pub use config::RuntimeConfig;
pub use error::{DomainError, DomainResult};
pub use id::{EventId, OperationId, TenantId};
