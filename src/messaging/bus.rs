use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::broker::{headers, BrokerError, BrokerMessage, BrokerSubscription, Delivery, MessageBroker};
use super::handler::{Binding, ErasedBinding, EventHandler, HandlerContext, HandlerRegistration};
use crate::events::{DecodeError, Event, EventFactory, EventPayload};
use crate::metrics::Metrics;
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

// ============================================================================
// Typed Event Bus
// ============================================================================
//
// Publish side: serialize a typed event, tag it with its event_type and send.
// No retries here; the relay owns retrying.
//
// Consume side: one loop per bus, handlers inline on the loop task so a
// partition (and therefore an aggregate) is processed strictly in order.
//
//   all handlers ok     -> commit
//   any handler failed  -> no commit, back off, rewind (redelivered)
//   decode failure      -> poison: log, dead-letter if configured, commit
//   transport failure   -> returned to the caller
//
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_write_topic")]
    pub write_topic: String,
    #[serde(default)]
    pub read_topics: Vec<String>,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    #[serde(default = "default_handler_retry_backoff_ms")]
    pub handler_retry_backoff_ms: u64,
}

fn default_write_topic() -> String {
    "customer.events".to_string()
}

fn default_consumer_group() -> String {
    "outbox-bus".to_string()
}

fn default_handler_retry_backoff_ms() -> u64 {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            write_topic: default_write_topic(),
            read_topics: Vec::new(),
            consumer_group: default_consumer_group(),
            dead_letter_topic: None,
            handler_retry_backoff_ms: default_handler_retry_backoff_ms(),
        }
    }
}

impl BusConfig {
    pub fn handler_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.handler_retry_backoff_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] BrokerError),

    #[error("invalid handler registration: {0}")]
    InvalidRegistration(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("bus has no read topics configured")]
    NoReadTopics,
}

#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler_name: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Poison message: nothing was invoked
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// At least one handler failed; the others still ran
    #[error("{} handler(s) failed", .0.len())]
    Handler(Vec<HandlerFailure>),
}

#[derive(Default)]
struct DispatchTable {
    by_type: HashMap<String, Vec<Arc<dyn ErasedBinding>>>,
    // every registration, in registration order
    registrations: Vec<HandlerRegistration>,
}

pub struct EventBus {
    broker: Arc<dyn MessageBroker>,
    config: BusConfig,
    table: RwLock<DispatchTable>,
    metrics: Option<Arc<Metrics>>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn MessageBroker>, config: BusConfig) -> Self {
        Self {
            broker,
            config,
            table: RwLock::new(DispatchTable::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn read_topics(&self) -> &[String] {
        &self.config.read_topics
    }

    pub fn write_topic(&self) -> &str {
        &self.config.write_topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.config.consumer_group
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.config.dead_letter_topic.as_deref()
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Serialize `event` and send it to `topic`, keyed by its aggregate id.
    pub async fn publish<T: EventPayload>(&self, topic: &str, event: &Event<T>) -> Result<(), BusError> {
        if event.event_type.trim().is_empty() {
            return Err(BusError::InvalidEvent("event_type must not be empty".into()));
        }
        let payload = event.encode_payload()?;

        let message = BrokerMessage::new(topic, event.event_type.as_str(), payload)
            .with_key(event.aggregate_id.as_str())
            .with_header(headers::EVENT_ID, event.event_id.to_string())
            .with_header(headers::AGGREGATE_TYPE, event.aggregate_type.as_str())
            .with_header(headers::AGGREGATE_ID, event.aggregate_id.as_str())
            .with_header(headers::OCCURRED_AT, event.occurred_at.to_rfc3339());

        self.send(message).await
    }

    /// Send already-serialized bytes tagged with `event_type`, unkeyed.
    pub async fn publish_raw(&self, topic: &str, event_type: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.publish_message(BrokerMessage::new(topic, event_type, payload)).await
    }

    /// Send a prepared message as is, keeping its key and headers.
    ///
    /// Replaying a stored or dead-lettered message through here keeps its
    /// partitioning and its `event_id` idempotency key.
    pub async fn publish_message(&self, message: BrokerMessage) -> Result<(), BusError> {
        if message.event_type().map_or(true, |t| t.trim().is_empty()) {
            return Err(BusError::InvalidEvent("event_type must not be empty".into()));
        }
        self.send(message).await
    }

    async fn send(&self, message: BrokerMessage) -> Result<(), BusError> {
        if message.topic.trim().is_empty() {
            return Err(BusError::InvalidEvent("topic must not be empty".into()));
        }
        self.broker.send(&message).await?;
        tracing::debug!(topic = %message.topic, event_type = ?message.event_type(), "Event published");
        Ok(())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Bind `handler` to the event_type produced by `factory`.
    ///
    /// Handlers of one event_type run in registration order.
    pub async fn register_handler<F, H>(&self, factory: F, handler: H) -> Result<HandlerRegistration, BusError>
    where
        F: EventFactory,
        H: EventHandler<F::Payload>,
    {
        let name = std::any::type_name::<H>().to_string();
        self.register_handler_named(name, factory, handler).await
    }

    pub async fn register_handler_named<F, H>(
        &self,
        handler_name: impl Into<String>,
        factory: F,
        handler: H,
    ) -> Result<HandlerRegistration, BusError>
    where
        F: EventFactory,
        H: EventHandler<F::Payload>,
    {
        if factory.event_type().trim().is_empty() {
            return Err(BusError::InvalidRegistration("factory produced an empty event_type".into()));
        }
        let handler_name = handler_name.into();
        if handler_name.trim().is_empty() {
            return Err(BusError::InvalidRegistration("handler name must not be empty".into()));
        }

        let binding = Binding::new(factory, handler, handler_name);
        let registration = binding.registration().clone();

        let mut table = self.table.write().await;
        table
            .by_type
            .entry(registration.event_type.clone())
            .or_default()
            .push(Arc::new(binding));
        table.registrations.push(registration.clone());

        tracing::info!(
            event_type = %registration.event_type,
            handler = %registration.handler_name,
            payload_type = registration.payload_type,
            "Handler registered"
        );
        Ok(registration)
    }

    pub async fn handler_count(&self) -> usize {
        self.table.read().await.registrations.len()
    }

    pub async fn registrations(&self) -> Vec<HandlerRegistration> {
        self.table.read().await.registrations.clone()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Decode `delivery` for every bound handler, then run them in order.
    ///
    /// A decode failure means no handler runs. A handler failure does not
    /// stop the handlers after it.
    pub async fn dispatch(&self, delivery: &Delivery, cancellation: &CancellationToken) -> Result<(), DispatchError> {
        let event_type = delivery
            .message
            .event_type()
            .filter(|t| !t.trim().is_empty())
            .ok_or(DecodeError::MissingEventType)?
            .to_string();

        let bindings = {
            let table = self.table.read().await;
            table.by_type.get(&event_type).cloned().unwrap_or_default()
        };
        if bindings.is_empty() {
            return Err(DecodeError::UnknownEventType(event_type).into());
        }

        let mut calls = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let call = binding.prepare(&delivery.message.payload)?;
            calls.push((binding.registration().handler_name.clone(), call));
        }

        let ctx = HandlerContext::from_delivery(delivery, &event_type, cancellation.clone());
        let mut failures = Vec::new();
        for (handler_name, call) in calls {
            let started = Instant::now();
            let result = call(ctx.clone()).await;
            if let Some(metrics) = &self.metrics {
                metrics.observe_handler(&event_type, started.elapsed().as_secs_f64());
            }

            if let Err(e) = result {
                tracing::warn!(
                    error_kind = "handler",
                    event_type = %event_type,
                    handler = %handler_name,
                    topic = %ctx.topic,
                    offset = ctx.offset,
                    error = %format!("{:#}", e),
                    "Handler failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_handler_failure(&event_type, &handler_name);
                }
                failures.push(HandlerFailure {
                    handler_name,
                    error: format!("{:#}", e),
                });
            }
        }

        if !failures.is_empty() {
            return Err(DispatchError::Handler(failures));
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_handled(&event_type);
        }
        Ok(())
    }

    // ========================================================================
    // Consume Loop
    // ========================================================================

    /// Consume all read topics for the bus's consumer group until `cancellation`
    /// fires. Returns `Ok(())` on cancellation; fetched but uncommitted
    /// messages are redelivered to the next consumer of the group.
    pub async fn start_consuming(&self, cancellation: CancellationToken) -> Result<(), BusError> {
        if self.config.read_topics.is_empty() {
            return Err(BusError::NoReadTopics);
        }

        let mut subscription = self
            .broker
            .subscribe(&self.config.read_topics, &self.config.consumer_group)
            .await?;

        tracing::info!(
            topics = ?self.config.read_topics,
            group = %self.config.consumer_group,
            "🚀 Event bus consuming"
        );

        let result = self.consume(subscription.as_mut(), &cancellation).await;
        subscription.close().await;

        match &result {
            Ok(()) => tracing::info!(group = %self.config.consumer_group, "Event bus stopped"),
            Err(e) => tracing::error!(group = %self.config.consumer_group, error = %e, "Event bus stopped with error"),
        }
        result
    }

    async fn consume(
        &self,
        subscription: &mut dyn BrokerSubscription,
        cancellation: &CancellationToken,
    ) -> Result<(), BusError> {
        let backoff = self.config.handler_retry_backoff();

        loop {
            let next = tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                next = subscription.next() => next,
            };
            let delivery = match next {
                None => return Ok(()),
                Some(delivery) => delivery?,
            };

            let outcome = tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                outcome = self.dispatch(&delivery, cancellation) => outcome,
            };

            match outcome {
                Ok(()) => subscription.commit(&delivery).await?,
                Err(DispatchError::Decode(err)) => {
                    self.isolate_poison(&delivery, &err).await?;
                    subscription.commit(&delivery).await?;
                }
                Err(DispatchError::Handler(failures)) => {
                    tracing::warn!(
                        topic = %delivery.message.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        failed = failures.len(),
                        backoff_ms = backoff.as_millis() as u64,
                        "Message not acknowledged, will be redelivered"
                    );
                    tokio::select! {
                        _ = cancellation.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    subscription.rewind(&delivery).await?;
                }
            }
        }
    }

    async fn isolate_poison(&self, delivery: &Delivery, err: &DecodeError) -> Result<(), BrokerError> {
        let reason = match err {
            DecodeError::MissingEventType => "missing_event_type",
            DecodeError::UnknownEventType(_) => "unknown_event_type",
            DecodeError::Malformed { .. } => "malformed_payload",
        };
        let event_type = delivery.message.event_type().unwrap_or("unknown");

        tracing::error!(
            error_kind = "decode",
            reason = reason,
            event_type = %event_type,
            topic = %delivery.message.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            error = %err,
            "Poison message isolated"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_decode_failure(reason);
        }

        let Some(dead_letter_topic) = &self.config.dead_letter_topic else {
            return Ok(());
        };

        let mut message = delivery.message.clone();
        message.topic = dead_letter_topic.clone();
        let message = message
            .with_header(headers::DLQ_REASON, err.to_string())
            .with_header(headers::DLQ_SOURCE_TOPIC, delivery.message.topic.as_str())
            .with_header(headers::DLQ_SOURCE_OFFSET, delivery.offset.to_string());

        let broker = &self.broker;
        let message = &message;
        match retry_with_backoff(&RetryConfig::conservative(), move |_attempt| broker.send(message)).await {
            RetryResult::Success(()) => {
                tracing::info!(topic = %dead_letter_topic, offset = delivery.offset, "Poison message dead-lettered");
                if let Some(metrics) = &self.metrics {
                    metrics.record_dead_letter(event_type);
                }
                Ok(())
            }
            // Not committed, so the message comes back once the broker recovers
            RetryResult::Failed { error, attempts } => {
                tracing::error!(
                    topic = %dead_letter_topic,
                    attempts = attempts,
                    error = %error,
                    "Failed to dead-letter poison message"
                );
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct OrderPlaced {
        order_id: String,
    }

    impl EventPayload for OrderPlaced {
        const EVENT_TYPE: &'static str = "order.placed";
        const AGGREGATE_TYPE: &'static str = "order";
    }

    struct RejectingFactory;

    impl EventFactory for RejectingFactory {
        type Payload = OrderPlaced;

        fn event_type(&self) -> &str {
            OrderPlaced::EVENT_TYPE
        }

        fn decode(&self, _bytes: &[u8]) -> Result<OrderPlaced, DecodeError> {
            Err(DecodeError::Malformed {
                event_type: OrderPlaced::EVENT_TYPE.into(),
                reason: "rejected".into(),
            })
        }
    }

    struct BlankFactory;

    impl EventFactory for BlankFactory {
        type Payload = OrderPlaced;

        fn event_type(&self) -> &str {
            "  "
        }

        fn decode(&self, _bytes: &[u8]) -> Result<OrderPlaced, DecodeError> {
            unreachable!()
        }
    }

    fn bus_with(broker: &InMemoryBroker, dead_letter_topic: Option<&str>) -> EventBus {
        EventBus::new(
            Arc::new(broker.clone()),
            BusConfig {
                write_topic: "order.events".into(),
                read_topics: vec!["order.events".into()],
                consumer_group: "test-group".into(),
                dead_letter_topic: dead_letter_topic.map(str::to_string),
                handler_retry_backoff_ms: 10,
            },
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl EventHandler<OrderPlaced> {
        let log = log.clone();
        move |_ctx: HandlerContext, event: OrderPlaced| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{}:{}", tag, event.order_id));
                Ok::<(), anyhow::Error>(())
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let broker = InMemoryBroker::new();
        let bus = Arc::new(bus_with(&broker, None));
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register_handler_named("h1", OrderPlaced::factory(), recorder(&log, "h1"))
            .await
            .unwrap();
        bus.register_handler_named("h2", OrderPlaced::factory(), recorder(&log, "h2"))
            .await
            .unwrap();

        let event = Event::new("o-1", OrderPlaced { order_id: "o-1".into() });
        bus.publish(bus.write_topic(), &event).await.unwrap();

        let token = CancellationToken::new();
        let consumer = tokio::spawn({
            let bus = bus.clone();
            let token = token.clone();
            async move { bus.start_consuming(token).await }
        });

        wait_until(|| broker.committed_offset("test-group", "order.events") == Some(1)).await;
        token.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["h1:o-1".to_string(), "h2:o-1".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_later_handlers() {
        let broker = InMemoryBroker::new();
        let bus = bus_with(&broker, None);
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register_handler_named(
            "broken",
            OrderPlaced::factory(),
            |_ctx: HandlerContext, _event: OrderPlaced| async { Err::<(), _>(anyhow::anyhow!("boom")) },
        )
        .await
        .unwrap();
        bus.register_handler_named("h2", OrderPlaced::factory(), recorder(&log, "h2"))
            .await
            .unwrap();

        let delivery = Delivery {
            message: BrokerMessage::new("order.events", "order.placed", br#"{"order_id":"o-9"}"#.to_vec()),
            partition: 0,
            offset: 0,
        };
        let result = bus.dispatch(&delivery, &CancellationToken::new()).await;

        match result {
            Err(DispatchError::Handler(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].handler_name, "broken");
            }
            other => panic!("expected handler failure, got {:?}", other),
        }
        assert_eq!(*log.lock().unwrap(), vec!["h2:o-9".to_string()]);
    }

    #[tokio::test]
    async fn test_decode_failure_runs_no_handler() {
        let broker = InMemoryBroker::new();
        let bus = bus_with(&broker, None);
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register_handler_named("h1", OrderPlaced::factory(), recorder(&log, "h1"))
            .await
            .unwrap();
        bus.register_handler_named("strict", RejectingFactory, recorder(&log, "strict"))
            .await
            .unwrap();

        let delivery = Delivery {
            message: BrokerMessage::new("order.events", "order.placed", br#"{"order_id":"o-1"}"#.to_vec()),
            partition: 0,
            offset: 0,
        };
        let result = bus.dispatch(&delivery, &CancellationToken::new()).await;

        assert!(matches!(result, Err(DispatchError::Decode(DecodeError::Malformed { .. }))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poison_message_does_not_block_partition() {
        let broker = InMemoryBroker::new();
        let bus = Arc::new(bus_with(&broker, Some("order.dlq")).with_metrics(Arc::new(Metrics::new().unwrap())));
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register_handler(OrderPlaced::factory(), recorder(&log, "h"))
            .await
            .unwrap();

        bus.publish_raw("order.events", "order.cancelled", b"{}".to_vec())
            .await
            .unwrap();
        bus.publish_raw("order.events", "order.placed", b"not json".to_vec())
            .await
            .unwrap();
        let event = Event::new("o-2", OrderPlaced { order_id: "o-2".into() });
        bus.publish("order.events", &event).await.unwrap();

        let token = CancellationToken::new();
        let consumer = tokio::spawn({
            let bus = bus.clone();
            let token = token.clone();
            async move { bus.start_consuming(token).await }
        });

        wait_until(|| broker.committed_offset("test-group", "order.events") == Some(3)).await;
        token.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["h:o-2".to_string()]);

        let dead = broker.messages("order.dlq");
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].event_type(), Some("order.cancelled"));
        assert_eq!(dead[0].header(headers::DLQ_SOURCE_TOPIC), Some("order.events"));
        assert_eq!(dead[0].header(headers::DLQ_SOURCE_OFFSET), Some("0"));
        assert!(dead[1].header(headers::DLQ_REASON).unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_handler_failure_blocks_commit_until_redelivery_succeeds() {
        let broker = InMemoryBroker::new();
        let bus = Arc::new(bus_with(&broker, None));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        bus.register_handler(OrderPlaced::factory(), move |_ctx: HandlerContext, _event: OrderPlaced| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("downstream unavailable");
                }
                Ok(())
            }
        })
        .await
        .unwrap();

        let event = Event::new("o-3", OrderPlaced { order_id: "o-3".into() });
        bus.publish("order.events", &event).await.unwrap();

        let token = CancellationToken::new();
        let consumer = tokio::spawn({
            let bus = bus.clone();
            let token = token.clone();
            async move { bus.start_consuming(token).await }
        });

        wait_until(|| broker.committed_offset("test-group", "order.events") == Some(1)).await;
        token.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_exits_idle_loop() {
        let broker = InMemoryBroker::new();
        let bus = bus_with(&broker, None);
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), bus.start_consuming(token)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_cancellation_mid_handler_leaves_message_uncommitted() {
        let broker = InMemoryBroker::new();
        let stuck = Arc::new(bus_with(&broker, None));
        let started = Arc::new(AtomicU32::new(0));

        let counter = started.clone();
        stuck
            .register_handler_named("slow", OrderPlaced::factory(), move |_ctx: HandlerContext, _event: OrderPlaced| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await
            .unwrap();

        let event = Event::new("o-6", OrderPlaced { order_id: "o-6".into() });
        stuck.publish(stuck.write_topic(), &event).await.unwrap();

        let token = CancellationToken::new();
        let consumer = tokio::spawn({
            let bus = stuck.clone();
            let token = token.clone();
            async move { bus.start_consuming(token).await }
        });
        wait_until(|| started.load(Ordering::SeqCst) == 1).await;

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), consumer).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert_eq!(broker.committed_offset("test-group", "order.events"), None);

        // the next consumer of the group gets the message exactly once
        let fresh = Arc::new(bus_with(&broker, None));
        let log = Arc::new(Mutex::new(Vec::new()));
        fresh
            .register_handler_named("h1", OrderPlaced::factory(), recorder(&log, "h1"))
            .await
            .unwrap();

        let token = CancellationToken::new();
        let consumer = tokio::spawn({
            let bus = fresh.clone();
            let token = token.clone();
            async move { bus.start_consuming(token).await }
        });
        wait_until(|| broker.committed_offset("test-group", "order.events") == Some(1)).await;
        token.cancel();
        consumer.await.unwrap().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["h1:o-6".to_string()]);
    }

    #[tokio::test]
    async fn test_start_consuming_requires_read_topics() {
        let broker = InMemoryBroker::new();
        let bus = EventBus::new(Arc::new(broker), BusConfig::default());
        let result = bus.start_consuming(CancellationToken::new()).await;
        assert!(matches!(result, Err(BusError::NoReadTopics)));
    }

    #[tokio::test]
    async fn test_blank_event_type_registration_is_rejected() {
        let broker = InMemoryBroker::new();
        let bus = bus_with(&broker, None);
        let log = Arc::new(Mutex::new(Vec::new()));

        let result = bus.register_handler(BlankFactory, recorder(&log, "h")).await;

        assert!(matches!(result, Err(BusError::InvalidRegistration(_))));
        assert_eq!(bus.handler_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_sets_wire_headers() {
        let broker = InMemoryBroker::new();
        let bus = bus_with(&broker, None);

        let event = Event::new("o-4", OrderPlaced { order_id: "o-4".into() });
        bus.publish("order.events", &event).await.unwrap();

        let sent = broker.messages("order.events");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key.as_deref(), Some("o-4"));
        assert_eq!(sent[0].event_type(), Some("order.placed"));
        assert_eq!(sent[0].header(headers::EVENT_ID), Some(event.event_id.to_string().as_str()));
        assert_eq!(sent[0].header(headers::AGGREGATE_TYPE), Some("order"));
        let body: OrderPlaced = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body.order_id, "o-4");
    }

    #[tokio::test]
    async fn test_replayed_message_keeps_key_and_event_id() {
        let broker = InMemoryBroker::new();
        let bus = bus_with(&broker, None);

        let event = Event::new("o-5", OrderPlaced { order_id: "o-5".into() });
        bus.publish("order.events", &event).await.unwrap();

        let mut replay = broker.messages("order.events").remove(0);
        replay.topic = "order.replay".into();
        bus.publish_message(replay).await.unwrap();

        let sent = broker.messages("order.replay");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key.as_deref(), Some("o-5"));
        assert_eq!(sent[0].header(headers::EVENT_ID), Some(event.event_id.to_string().as_str()));
        assert_eq!(sent[0].header(headers::AGGREGATE_ID), Some("o-5"));

        let untagged = BrokerMessage {
            topic: "order.replay".into(),
            key: Some("o-5".into()),
            headers: Default::default(),
            payload: b"{}".to_vec(),
        };
        assert!(matches!(
            bus.publish_message(untagged).await,
            Err(BusError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_surfaces_transport_errors() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sends(1);
        let bus = bus_with(&broker, None);

        let result = bus.publish_raw("order.events", "order.placed", b"{}".to_vec()).await;
        assert!(matches!(result, Err(BusError::Transport(BrokerError::Transport(_)))));
    }
}
