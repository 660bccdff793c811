//! The durable operation record and its bounded-attempt state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dteflow_core::{DomainError, DomainResult, OperationId, TenantId};

use crate::authority::AuthorityReceipt;

/// What the operation asks of the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Send a signed document for acceptance.
    Transmit,
    /// Cancel a previously accepted document (anulación).
    Invalidate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Transmit => "transmit",
            OperationKind::Invalidate => "invalidate",
        }
    }

    pub fn parse(value: &str) -> DomainResult<Self> {
        match value {
            "transmit" => Ok(OperationKind::Transmit),
            "invalidate" => Ok(OperationKind::Invalidate),
            other => Err(DomainError::validation(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// Remote outcome of the operation so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for the next sweep.
    Pending,
    /// An attempt was interrupted mid-call (crash recovery picks these up
    /// alongside pending ones).
    Processing,
    /// The authority confirmed receipt; terminal and immutable.
    Accepted,
    /// Attempt ceiling crossed; terminal, manual intervention required.
    Error,
}

impl OperationStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Accepted => "accepted",
            OperationStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> DomainResult<Self> {
        match value {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "accepted" => Ok(OperationStatus::Accepted),
            "error" => Ok(OperationStatus::Error),
            other => Err(DomainError::validation(format!(
                "unknown operation status: {other}"
            ))),
        }
    }
}

/// A queued transmit or invalidate request against the authority.
///
/// `attempt_count` strictly increases on every failed attempt; once it
/// crosses the queue's ceiling the status becomes `Error` permanently.
/// `Accepted` is reached at most once and is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryableOperation {
    pub id: OperationId,
    pub tenant_id: TenantId,
    /// Generated document code; the idempotent business key at the
    /// authority, so a duplicate transmit is harmless.
    pub business_key: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// Failed attempts so far.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// The authority's proof-of-receipt, set on acceptance.
    pub seal: Option<String>,
    /// Document body handed to `transmit`; empty object for invalidations.
    pub document: serde_json::Value,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryableOperation {
    pub fn transmit(
        tenant_id: TenantId,
        business_key: impl Into<String>,
        document: serde_json::Value,
    ) -> Self {
        Self::new(tenant_id, business_key, OperationKind::Transmit, document)
    }

    pub fn invalidate(tenant_id: TenantId, business_key: impl Into<String>) -> Self {
        Self::new(
            tenant_id,
            business_key,
            OperationKind::Invalidate,
            serde_json::Value::Object(serde_json::Map::new()),
        )
    }

    fn new(
        tenant_id: TenantId,
        business_key: impl Into<String>,
        kind: OperationKind,
        document: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            tenant_id,
            business_key: business_key.into(),
            kind,
            status: OperationStatus::Pending,
            attempt_count: 0,
            last_error: None,
            seal: None,
            document,
            accepted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the authority's confirmation. Terminal; refuses to overwrite
    /// an already-settled operation.
    pub fn mark_accepted(&mut self, receipt: AuthorityReceipt) -> DomainResult<()> {
        self.ensure_open("accept")?;
        self.status = OperationStatus::Accepted;
        self.seal = Some(receipt.seal);
        self.accepted_at = Some(receipt.confirmed_at);
        self.last_error = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failed attempt; crosses into `Error` once `attempt_count`
    /// exceeds `max_attempts`.
    pub fn mark_attempt_failed(
        &mut self,
        error: impl Into<String>,
        max_attempts: u32,
    ) -> DomainResult<()> {
        self.ensure_open("record a failed attempt on")?;
        self.attempt_count += 1;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
        if self.attempt_count > max_attempts {
            self.status = OperationStatus::Error;
        } else {
            self.status = OperationStatus::Pending;
        }
        Ok(())
    }

    fn ensure_open(&self, action: &str) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot {action} operation {}: already {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }
}
