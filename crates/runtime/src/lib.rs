//! `dteflow-runtime` — explicit assembly of the dispatch pipeline.
//!
//! No lazily-constructed globals: every service is built here, wired
//! together, and torn down through an explicit lifecycle
//! ([`DispatchPipeline::start`] / [`DispatchPipeline::shutdown`]).

pub mod pipeline;
pub mod wiring;

pub use pipeline::{DispatchPipeline, PipelineServices};
pub use wiring::{PipelineStores, WiringError, stores_from_env};
