use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::{Event, EventPayload};

// ============================================================================
// Outbox Record - one pending or published event row
// ============================================================================
//
// Lives in the same database as the domain tables. Two actors touch it:
// - the writer inserts it inside the caller's transaction
// - the relay updates published_at / attempts / last_error / next_attempt_at
//
// pending <=> published_at IS NULL
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build a fresh pending record from an event envelope.
    ///
    /// The record id reuses the event id so consumers can deduplicate on it.
    pub fn pending<T: EventPayload>(event: &Event<T>) -> Result<Self, OutboxError> {
        if event.event_type.trim().is_empty() {
            return Err(OutboxError::InvalidEvent("event_type must not be empty".into()));
        }
        if event.aggregate_type.trim().is_empty() {
            return Err(OutboxError::InvalidEvent("aggregate_type must not be empty".into()));
        }

        let payload = event.encode_payload()?;

        Ok(Self {
            id: event.event_id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload,
            occurred_at: event.occurred_at,
            created_at: Utc::now(),
            published_at: None,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.published_at.is_none()
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// The writer's statement failed; the caller's transaction must abort.
    #[error("outbox statement failed: {0}")]
    Transaction(#[from] sqlx::Error),

    #[error("failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("outbox store error: {0}")]
    Store(String),
}

// ============================================================================
// Store Abstractions
// ============================================================================

/// Anything an outbox row can be inserted into: an open transaction.
///
/// Implementors must never commit or roll back.
#[async_trait]
pub trait OutboxSink: Send {
    async fn insert_outbox_record(&mut self, record: &OutboxRecord) -> Result<(), OutboxError>;
}

/// Relay-facing side of the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    type Claim: OutboxClaim;

    /// Claim up to `limit` pending records, oldest first.
    ///
    /// Claimed records are invisible to other claims until the claim is
    /// finished or dropped. Per aggregate only the contiguous head of the
    /// pending queue is handed out.
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: Option<i32>,
    ) -> Result<Self::Claim, OutboxError>;

    /// Delete published records older than `older_than`. Returns rows removed.
    async fn prune_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError>;

    async fn stats(&self, max_attempts: Option<i32>) -> Result<OutboxStats, OutboxError>;
}

/// A batch of claimed records. Updates are durable only after `finish`;
/// dropping the claim discards them and leaves every record pending.
#[async_trait]
pub trait OutboxClaim: Send {
    fn records(&self) -> &[OutboxRecord];

    async fn mark_published(
        &mut self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    async fn mark_failed(
        &mut self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    async fn finish(self) -> Result<(), OutboxError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboxStats {
    pub pending: u64,
    pub published: u64,
    /// Pending records that reached `max_attempts` and are no longer claimed.
    pub stuck: u64,
    pub oldest_pending_age_secs: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct Noted {
        note: String,
    }

    impl EventPayload for Noted {
        const EVENT_TYPE: &'static str = "note.added";
        const AGGREGATE_TYPE: &'static str = "note";
    }

    #[test]
    fn test_pending_record_from_event() {
        let event = Event::new("n1", Noted { note: "hi".into() });
        let record = OutboxRecord::pending(&event).unwrap();

        assert_eq!(record.id, event.event_id);
        assert_eq!(record.event_type, "note.added");
        assert_eq!(record.aggregate_type, "note");
        assert_eq!(record.attempts, 0);
        assert!(record.is_pending());
        assert_eq!(record.payload, br#"{"note":"hi"}"#.to_vec());
    }

    #[test]
    fn test_pending_record_rejects_blank_event_type() {
        let mut event = Event::new("n1", Noted { note: "hi".into() });
        event.event_type = "  ".into();

        assert!(matches!(
            OutboxRecord::pending(&event),
            Err(OutboxError::InvalidEvent(_))
        ));
    }
}
