//! The durable outbox record and its status transitions.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use dteflow_core::{DomainError, DomainResult, EventId, TenantId};

use crate::backoff::RetryBackoff;

/// Sentinel `available_at` stamped on dead-lettered events; far enough out
/// that no poller ever picks them up again, near enough for Postgres.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Event type label used to route an event to a publisher.
///
/// A string newtype rather than a closed enum: the durable backlog may hold
/// types written by older or newer deployments, and recognition is decided
/// by the publisher registry at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("event type must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for delivery (possibly rescheduled after failures).
    Pending,
    /// Delivered downstream; terminal.
    Sent,
    /// Retries exhausted or unroutable; terminal, manual replay only.
    Failed,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Sent => "sent",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> DomainResult<Self> {
        match value {
            "pending" => Ok(EventStatus::Pending),
            "sent" => Ok(EventStatus::Sent),
            "failed" => Ok(EventStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown event status: {other}"
            ))),
        }
    }
}

/// A durable "to-be-delivered" record.
///
/// Created when a business action commits, mutated only by the relay, never
/// deleted (kept for audit and replay). While `Pending`, `retries` stays
/// below the relay's ceiling; crossing it moves the event to `Failed` with
/// `available_at` pushed to [`far_future`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: EventType,
    /// Opaque business payload; the relay never inspects it.
    pub payload: serde_json::Value,
    pub status: EventStatus,
    /// Failed delivery attempts so far.
    pub retries: u32,
    /// Earliest time the event is eligible for delivery.
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Most recent delivery error, kept for triage.
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Record a new event, immediately eligible for delivery.
    pub fn new(tenant_id: TenantId, event_type: EventType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            tenant_id,
            event_type,
            payload,
            status: EventStatus::Pending,
            retries: 0,
            available_at: now,
            created_at: now,
            last_error: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.available_at <= now
    }

    /// Terminal success.
    pub fn mark_sent(&mut self) -> DomainResult<()> {
        self.ensure_pending("mark sent")?;
        self.status = EventStatus::Sent;
        self.last_error = None;
        Ok(())
    }

    /// Record a failed delivery attempt: reschedule with backoff, or move to
    /// `Failed` once the attempt crosses `max_retries`.
    ///
    /// The delay is computed from the retry count before the increment, so
    /// the first reschedule waits the full initial backoff.
    pub fn mark_delivery_failed(
        &mut self,
        error: impl Into<String>,
        backoff: &RetryBackoff,
        max_retries: u32,
    ) -> DomainResult<()> {
        self.ensure_pending("record delivery failure")?;
        let delay = backoff.delay_for(self.retries);
        self.retries += 1;
        self.last_error = Some(error.into());

        if self.retries >= max_retries {
            self.status = EventStatus::Failed;
            self.available_at = far_future();
        } else {
            self.available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        }
        Ok(())
    }

    /// Permanent per-event failure (unrecognized type, validation); straight
    /// to `Failed` without consuming the retry budget.
    pub fn mark_unroutable(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.ensure_pending("mark unroutable")?;
        self.status = EventStatus::Failed;
        self.available_at = far_future();
        self.last_error = Some(error.into());
        Ok(())
    }

    fn ensure_pending(&self, action: &str) -> DomainResult<()> {
        if self.status != EventStatus::Pending {
            return Err(DomainError::invariant(format!(
                "cannot {action}: event {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }
}
