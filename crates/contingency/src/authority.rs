//! Seam for the government tax authority's API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dteflow_core::TenantId;

/// Proof of receipt returned by the authority on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityReceipt {
    /// The authority's cryptographic seal (sello).
    pub seal: String,
    pub confirmed_at: DateTime<Utc>,
}

/// A rejected or failed authority call.
///
/// Network failures and non-2xx responses all land here; the queue treats
/// every variant of failure as retryable and interprets nothing beyond
/// success/failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authority call failed: {0}")]
pub struct AuthorityError(pub String);

impl AuthorityError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Remote calls against the tax authority. Consumed, never implemented
/// here; both calls may be slow and must be awaited off the hot path.
#[async_trait::async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Submit a signed document for acceptance.
    async fn transmit(
        &self,
        tenant_id: TenantId,
        document: &serde_json::Value,
    ) -> Result<AuthorityReceipt, AuthorityError>;

    /// Cancel a previously accepted document by its business key.
    async fn invalidate(
        &self,
        tenant_id: TenantId,
        business_key: &str,
    ) -> Result<AuthorityReceipt, AuthorityError>;
}
