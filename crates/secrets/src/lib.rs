//! `dteflow-secrets` — secure handling of credential material.
//!
//! Certificates and passphrases pass through the signing pipeline in memory
//! only. This crate provides the erasure primitives the pipeline relies on:
//! in-place zeroization, a shared wipeable cell so the pool can scrub the
//! caller's copy after every task, constant-time comparison, and SHA-256
//! fingerprints for logging material without exposing it.

pub mod cell;
pub mod erase;

pub use cell::{SecretCell, SecretError};
pub use erase::{constant_time_eq, fingerprint_hex, wipe};
