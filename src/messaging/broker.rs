use async_trait::async_trait;
use std::collections::BTreeMap;

// ============================================================================
// Broker Abstraction
// ============================================================================
//
// The relay and the bus talk to the broker only through these two traits.
// Production runs on Redpanda via rdkafka, tests and local runs on the
// in-memory broker.
//
// Wire contract of every message:
//   key     = aggregate_id
//   headers = event_type, event_id, aggregate_type, aggregate_id, occurred_at
//   value   = JSON payload bytes
//
// ============================================================================

/// Header names shared by producers and consumers
pub mod headers {
    pub const EVENT_TYPE: &str = "event_type";
    pub const EVENT_ID: &str = "event_id";
    pub const AGGREGATE_TYPE: &str = "aggregate_type";
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const OCCURRED_AT: &str = "occurred_at";

    // Added when a poison message is forwarded to the dead-letter topic
    pub const DLQ_REASON: &str = "dlq_reason";
    pub const DLQ_SOURCE_TOPIC: &str = "dlq_source_topic";
    pub const DLQ_SOURCE_OFFSET: &str = "dlq_source_offset";
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(headers::EVENT_TYPE.to_string(), event_type.into());
        Self {
            topic: topic.into(),
            key: None,
            headers,
            payload,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(headers::EVENT_TYPE)
    }
}

/// A consumed message with its position in the topic
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: BrokerMessage,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("circuit breaker open, broker unavailable")]
    CircuitOpen,

    #[error("subscription closed")]
    Closed,

    #[error("broker configuration error: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Send one message and wait for the broker's acknowledgement.
    async fn send(&self, message: &BrokerMessage) -> Result<(), BrokerError>;

    /// Join `group` and subscribe to `topics`.
    async fn subscribe(
        &self,
        topics: &[String],
        group: &str,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError>;
}

#[async_trait]
pub trait BrokerSubscription: Send {
    /// Wait for the next message. `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Mark `delivery` and everything before it in its partition as consumed.
    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Deliver `delivery` again on the next call to `next`.
    async fn rewind(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_carries_event_type_header() {
        let message = BrokerMessage::new("customer.events", "customer.created", b"{}".to_vec())
            .with_key("c-1")
            .with_header(headers::EVENT_ID, "abc");

        assert_eq!(message.event_type(), Some("customer.created"));
        assert_eq!(message.header(headers::EVENT_ID), Some("abc"));
        assert_eq!(message.key.as_deref(), Some("c-1"));
        assert_eq!(message.header(headers::DLQ_REASON), None);
    }
}
