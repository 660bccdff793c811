//! Seam for the actual cryptographic signing implementation.

use serde_json::Value as JsonValue;

use crate::task::{SignError, SignedDocument};

/// Signs a single document with the given certificate material.
///
/// Implementations are blocking and CPU-bound; the pool always invokes them
/// on a dedicated worker thread, one request/response pair per task. The
/// borrowed slices are only valid for the duration of the call and must not
/// be copied out.
pub trait DocumentSigner: Send + Sync {
    fn sign(
        &self,
        payload: &JsonValue,
        certificate: &[u8],
        passphrase: &[u8],
    ) -> Result<SignedDocument, SignError>;
}
