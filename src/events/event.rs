use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use uuid::Uuid;

// ============================================================================
// Event Envelope - the unit every domain service emits
// ============================================================================
//
// An `Event<T>` wraps one payload shape with the metadata the outbox and the
// bus need: the event_type discriminator, the aggregate it belongs to and the
// time it happened. Payload shapes are unrelated structs living in their own
// domain modules; the only thing they share is the `EventPayload` trait.
//
// ============================================================================

/// A payload shape that can travel through the outbox and the event bus.
///
/// `EVENT_TYPE` is the wire discriminator (e.g. `customer.created`),
/// `AGGREGATE_TYPE` names the entity whose stream the event belongs to.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
    const AGGREGATE_TYPE: &'static str;

    /// The default JSON factory for this payload.
    fn factory() -> JsonFactory<Self>
    where
        Self: Sized,
    {
        JsonFactory::new()
    }
}

/// Generic event envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: T,
}

impl<T: EventPayload> Event<T> {
    pub fn new(aggregate_id: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: T::EVENT_TYPE.to_string(),
            aggregate_type: T::AGGREGATE_TYPE.to_string(),
            aggregate_id: aggregate_id.into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Encode the payload for the outbox row or the broker message body.
    pub fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }
}

// ============================================================================
// Decoding Factories
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message carries no event_type header")]
    MissingEventType,

    #[error("no handler registered for event type '{0}'")]
    UnknownEventType(String),

    #[error("malformed '{event_type}' payload: {reason}")]
    Malformed { event_type: String, reason: String },
}

/// Decodes the raw bytes of one event_type into a typed payload.
pub trait EventFactory: Send + Sync + 'static {
    type Payload: Send + 'static;

    fn event_type(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Payload, DecodeError>;
}

/// JSON factory for any `EventPayload`
pub struct JsonFactory<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> JsonFactory<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: EventPayload> EventFactory for JsonFactory<T> {
    type Payload = T;

    fn event_type(&self) -> &str {
        T::EVENT_TYPE
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed {
            event_type: T::EVENT_TYPE.to_string(),
            reason: e.to_string(),
        })
    }
}
