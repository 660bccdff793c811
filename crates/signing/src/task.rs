//! Task and result types for the signing pool.

use std::time::Duration;

use dteflow_secrets::SecretCell;
use serde_json::Value as JsonValue;

/// A document waiting to be signed.
///
/// The secret cells are shared handles: the caller may keep clones, and the
/// pool wipes the underlying bytes once the task settles, so no copy of the
/// material outlives the task on either side.
#[derive(Debug)]
pub struct SignTask {
    /// The DTE body to sign, opaque to the pool.
    pub payload: JsonValue,
    /// PKCS#12 certificate bytes.
    pub certificate: SecretCell,
    /// Certificate passphrase.
    pub passphrase: SecretCell,
}

impl SignTask {
    pub fn new(payload: JsonValue, certificate: SecretCell, passphrase: SecretCell) -> Self {
        Self {
            payload,
            certificate,
            passphrase,
        }
    }
}

/// Output of a successful signing run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignedDocument {
    /// Document body with the signature embedded.
    pub body: String,
    /// Detached signature value, kept for the transmission envelope.
    pub signature: String,
}

/// Why a signing task did not produce a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    /// The signer itself rejected the document or material.
    #[error("signing failed: {0}")]
    Failed(String),

    /// The task overran its wall-clock budget; the worker was replaced and
    /// any late result is discarded.
    #[error("signing timed out after {0:?}")]
    TimedOut(Duration),

    /// The worker thread panicked while signing.
    #[error("signer worker crashed: {0}")]
    WorkerCrashed(String),

    /// Secret material was erased before the worker could use it; happens
    /// only to tasks already abandoned by a timeout.
    #[error("secret material was wiped before signing")]
    MaterialWiped,

    /// The pool is shutting down and no longer accepts or runs tasks.
    #[error("signer pool is shutting down")]
    ShuttingDown,
}

impl SignError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn worker_crashed(msg: impl Into<String>) -> Self {
        Self::WorkerCrashed(msg.into())
    }
}
