use uuid::Uuid;

use crate::events::{Event, EventPayload};
use super::record::{OutboxError, OutboxRecord, OutboxSink};

// ============================================================================
// Transactional Outbox Writer
// ============================================================================
//
// Appends the outbox row as one more statement of the caller's transaction.
// Commit and rollback stay with the caller: if the domain change commits, the
// event row commits with it; if it rolls back, neither exists.
//
// Any error here must abort the caller's transaction, so everything is
// returned rather than logged and swallowed.
//
// ============================================================================

/// Write one event into the caller's open transaction.
///
/// Returns the outbox record id (equal to the event id).
pub async fn write_event<S, T>(tx: &mut S, event: &Event<T>) -> Result<Uuid, OutboxError>
where
    S: OutboxSink + ?Sized,
    T: EventPayload,
{
    let record = OutboxRecord::pending(event)?;
    tx.insert_outbox_record(&record).await?;

    tracing::debug!(
        event_id = %record.id,
        event_type = %record.event_type,
        aggregate_type = %record.aggregate_type,
        aggregate_id = %record.aggregate_id,
        "Outbox record staged in caller transaction"
    );

    Ok(record.id)
}

/// Write several events of one payload shape, in order.
pub async fn write_events<S, T>(tx: &mut S, events: &[Event<T>]) -> Result<Vec<Uuid>, OutboxError>
where
    S: OutboxSink + ?Sized,
    T: EventPayload,
{
    let mut ids = Vec::with_capacity(events.len());
    for event in events {
        ids.push(write_event(tx, event).await?);
    }
    Ok(ids)
}
