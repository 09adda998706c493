use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::record::{OutboxClaim, OutboxError, OutboxRecord, OutboxStore};
use crate::messaging::{headers, BrokerMessage, MessageBroker};
use crate::metrics::Metrics;
use crate::service::health::{ComponentHealth, HealthCheckable, HealthStatus};
use crate::utils::RetryConfig;

// ============================================================================
// Outbox Relay
// ============================================================================
//
// Polls the outbox table and forwards pending records to the broker:
//
//   1. claim a batch (oldest first, per-aggregate head of queue only)
//   2. publish each record, keyed by aggregate_id
//   3. published  -> published_at = now
//      failed     -> attempts + 1, last_error, next_attempt_at = now + backoff;
//                    later records of the same aggregate are deferred
//   4. finish the claim, making all updates durable at once
//
// Cancellation stops the batch between sends; records not yet sent stay
// pending. A crash before step 4 leaves every record of the batch pending, so records
// that already reached the broker are sent again (at-least-once). Consumers
// deduplicate on the event_id header.
//
// ============================================================================

/// How a record's topic is derived
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopicStrategy {
    /// `{aggregate_type}{suffix}`, e.g. `customer.events`
    PerAggregate {
        #[serde(default = "default_topic_suffix")]
        suffix: String,
    },
    /// The record's event_type
    PerEventType,
    /// Everything to one topic
    Fixed { topic: String },
}

fn default_topic_suffix() -> String {
    ".events".to_string()
}

impl Default for TopicStrategy {
    fn default() -> Self {
        TopicStrategy::PerAggregate {
            suffix: default_topic_suffix(),
        }
    }
}

impl TopicStrategy {
    pub fn topic_for(&self, record: &OutboxRecord) -> String {
        match self {
            TopicStrategy::PerAggregate { suffix } => format!("{}{}", record.aggregate_type, suffix),
            TopicStrategy::PerEventType => record.event_type.clone(),
            TopicStrategy::Fixed { topic } => topic.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Records reaching this many failed attempts are no longer claimed
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// How long published records are kept before the retention sweep deletes them
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub topic_strategy: TopicStrategy,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_stats_interval_secs() -> u64 {
    15
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_attempts: None,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retention_secs: default_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            topic_strategy: TopicStrategy::default(),
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.map_or(u32::MAX, |max| max.max(0) as u32),
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Outcome of one relay pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Left untouched because an earlier record of the same aggregate failed
    pub deferred: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] OutboxError),
}

#[derive(Default)]
struct RelayHealth {
    consecutive_errors: u32,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
}

pub struct OutboxRelay<S: OutboxStore> {
    store: Arc<S>,
    broker: Arc<dyn MessageBroker>,
    config: RelayConfig,
    backoff: RetryConfig,
    metrics: Option<Arc<Metrics>>,
    health: Mutex<RelayHealth>,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: Arc<S>, broker: Arc<dyn MessageBroker>, config: RelayConfig) -> Self {
        let backoff = config.backoff();
        Self {
            store,
            broker,
            config,
            backoff,
            metrics: None,
            health: Mutex::new(RelayHealth::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn message_for(&self, record: &OutboxRecord) -> BrokerMessage {
        BrokerMessage::new(
            self.config.topic_strategy.topic_for(record),
            record.event_type.as_str(),
            record.payload.clone(),
        )
        .with_key(record.aggregate_id.as_str())
        .with_header(headers::EVENT_ID, record.id.to_string())
        .with_header(headers::AGGREGATE_TYPE, record.aggregate_type.as_str())
        .with_header(headers::AGGREGATE_ID, record.aggregate_id.as_str())
        .with_header(headers::OCCURRED_AT, record.occurred_at.to_rfc3339())
    }

    fn next_attempt_at(&self, failures: u32) -> DateTime<Utc> {
        let delay = self.backoff.delay_for_attempt(failures);
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Claim one batch, publish it and record the outcome of every record.
    pub async fn run_once(&self) -> Result<RelayReport, RelayError> {
        self.run_batch(&CancellationToken::new()).await
    }

    /// Like `run_once`, but stops sending when `cancellation` fires. Records
    /// sent so far are recorded; the rest count as deferred and stay pending.
    pub async fn run_batch(&self, cancellation: &CancellationToken) -> Result<RelayReport, RelayError> {
        let started = Instant::now();
        let mut claim = self
            .store
            .claim_pending(self.config.batch_size, self.config.max_attempts)
            .await?;
        let records = claim.records().to_vec();

        let mut report = RelayReport {
            claimed: records.len(),
            ..RelayReport::default()
        };
        let mut blocked: HashSet<&str> = HashSet::new();

        for (index, record) in records.iter().enumerate() {
            if blocked.contains(record.aggregate_id.as_str()) {
                report.deferred += 1;
                continue;
            }

            let message = self.message_for(record);
            let sent = tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                sent = self.broker.send(&message) => Some(sent),
            };
            let Some(sent) = sent else {
                let unsent = records.len() - index;
                report.deferred += unsent;
                tracing::info!(unsent = unsent, "Relay cancelled mid-batch, unsent records stay pending");
                break;
            };

            match sent {
                Ok(()) => {
                    claim.mark_published(record.id, Utc::now()).await?;
                    report.published += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_outbox_publish(&record.event_type, true);
                    }
                }
                Err(e) => {
                    let attempts = record.attempts + 1;
                    let next_attempt_at = self.next_attempt_at(attempts.max(0) as u32);
                    claim.mark_failed(record.id, &e.to_string(), next_attempt_at).await?;
                    blocked.insert(record.aggregate_id.as_str());
                    report.failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_outbox_publish(&record.event_type, false);
                    }

                    if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                        tracing::error!(
                            record_id = %record.id,
                            aggregate_id = %record.aggregate_id,
                            event_type = %record.event_type,
                            attempts = attempts,
                            error = %e,
                            "Outbox record exhausted its attempts and is stuck"
                        );
                    } else {
                        tracing::warn!(
                            record_id = %record.id,
                            aggregate_id = %record.aggregate_id,
                            event_type = %record.event_type,
                            attempts = attempts,
                            next_attempt_at = %next_attempt_at,
                            error = %e,
                            "Outbox publish failed, will retry"
                        );
                    }
                }
            }
        }

        claim.finish().await?;

        if let Some(metrics) = &self.metrics {
            metrics.observe_relay_batch(started.elapsed().as_secs_f64());
        }
        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                published = report.published,
                failed = report.failed,
                deferred = report.deferred,
                "Relay batch finished"
            );
        }
        Ok(report)
    }

    /// Delete published records older than the retention window.
    pub async fn prune(&self) -> Result<u64, RelayError> {
        let older_than = Utc::now()
            - chrono::Duration::from_std(self.config.retention()).unwrap_or_else(|_| chrono::Duration::zero());
        let pruned = self.store.prune_published(older_than).await?;
        if pruned > 0 {
            tracing::info!(pruned = pruned, "Pruned published outbox records");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_pruned(pruned);
        }
        Ok(pruned)
    }

    async fn refresh_stats(&self) -> Result<(), RelayError> {
        let stats = self.store.stats(self.config.max_attempts).await?;
        if let Some(metrics) = &self.metrics {
            metrics.update_outbox_backlog(stats.pending, stats.stuck);
        }
        if stats.stuck > 0 {
            tracing::error!(stuck = stats.stuck, "Outbox has stuck records");
        }
        tracing::debug!(
            pending = stats.pending,
            published = stats.published,
            oldest_pending_age_secs = ?stats.oldest_pending_age_secs,
            "Outbox stats"
        );
        Ok(())
    }

    fn record_outcome(&self, outcome: &Result<RelayReport, RelayError>) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(_) => {
                health.consecutive_errors = 0;
                health.last_error = None;
                health.last_success = Some(Utc::now());
            }
            Err(e) => {
                health.consecutive_errors += 1;
                health.last_error = Some(e.to_string());
            }
        }
    }

    /// Poll until `cancellation` fires. A batch in flight stops at the next
    /// record and commits what it already sent.
    pub async fn run(&self, cancellation: CancellationToken) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval());
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats = tokio::time::interval(self.config.stats_interval());
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "🚀 Outbox relay started"
        );

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = poll.tick() => {
                    let outcome = self.run_batch(&cancellation).await;
                    if let Err(e) = &outcome {
                        tracing::error!(error = %e, "Relay pass failed");
                    }
                    self.record_outcome(&outcome);
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.prune().await {
                        tracing::error!(error = %e, "Outbox retention sweep failed");
                    }
                }
                _ = stats.tick() => {
                    if let Err(e) = self.refresh_stats().await {
                        tracing::warn!(error = %e, "Failed to read outbox stats");
                    }
                }
            }
        }

        tracing::info!("Outbox relay stopped");
    }
}

impl<S: OutboxStore> HealthCheckable for OutboxRelay<S> {
    fn check_health(&self) -> ComponentHealth {
        let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        let status = match (&health.last_error, health.consecutive_errors) {
            (Some(e), n) if n >= 3 => HealthStatus::Unhealthy(format!("{} consecutive failures: {}", n, e)),
            (Some(e), _) => HealthStatus::Degraded(e.clone()),
            (None, _) => HealthStatus::Healthy,
        };

        let component = ComponentHealth::new(self.component_name(), status);
        match health.last_success {
            Some(at) => component.with_details(format!("last successful pass at {}", at.to_rfc3339())),
            None => component,
        }
    }

    fn component_name(&self) -> &str {
        "outbox_relay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventPayload};
    use crate::messaging::{BrokerError, BrokerSubscription, InMemoryBroker};
    use crate::outbox::memory::InMemoryOutbox;
    use crate::outbox::writer::write_event;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct MemberJoined {
        member_id: String,
        seq: u32,
    }

    impl EventPayload for MemberJoined {
        const EVENT_TYPE: &'static str = "member.joined";
        const AGGREGATE_TYPE: &'static str = "member";
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            poll_interval_ms: 10,
            backoff_initial_ms: 0,
            ..RelayConfig::default()
        }
    }

    fn relay(store: &InMemoryOutbox, broker: &InMemoryBroker, config: RelayConfig) -> OutboxRelay<InMemoryOutbox> {
        OutboxRelay::new(Arc::new(store.clone()), Arc::new(broker.clone()), config)
    }

    async fn commit_event(store: &InMemoryOutbox, member_id: &str, seq: u32) -> uuid::Uuid {
        let mut tx = store.begin();
        let event = Event::new(member_id, MemberJoined { member_id: member_id.into(), seq });
        let id = write_event(&mut tx, &event).await.unwrap();
        tx.insert_row("members", member_id, serde_json::json!({ "seq": seq }));
        tx.commit();
        id
    }

    #[tokio::test]
    async fn test_committed_event_is_published_once() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let id = commit_event(&store, "m1", 1).await;

        let report = relay(&store, &broker, fast_config()).run_once().await.unwrap();

        assert_eq!(report.published, 1);
        let sent = broker.messages("member.events");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type(), Some("member.joined"));
        assert_eq!(sent[0].key.as_deref(), Some("m1"));
        assert_eq!(sent[0].header(headers::EVENT_ID), Some(id.to_string().as_str()));
        let body: MemberJoined = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body.member_id, "m1");
        assert!(store.record(id).unwrap().published_at.is_some());

        // nothing left to do
        let report = relay(&store, &broker, fast_config()).run_once().await.unwrap();
        assert_eq!(report, RelayReport::default());
        assert_eq!(broker.messages("member.events").len(), 1);
    }

    #[tokio::test]
    async fn test_rolled_back_event_is_never_sent() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();

        let mut tx = store.begin();
        let event = Event::new("m1", MemberJoined { member_id: "m1".into(), seq: 1 });
        write_event(&mut tx, &event).await.unwrap();
        tx.rollback();

        let report = relay(&store, &broker, fast_config()).run_once().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert!(store.records().is_empty());
        assert!(broker.messages("member.events").is_empty());
    }

    #[tokio::test]
    async fn test_retries_until_publish_succeeds() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let relay = relay(&store, &broker, fast_config());
        let id = commit_event(&store, "m1", 1).await;
        broker.fail_next_sends(2);

        for expected_attempts in 1..=2 {
            let report = relay.run_once().await.unwrap();
            assert_eq!(report.failed, 1);
            let record = store.record(id).unwrap();
            assert_eq!(record.attempts, expected_attempts);
            assert!(record.published_at.is_none());
            assert!(record.last_error.unwrap().contains("injected"));
        }

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        let record = store.record(id).unwrap();
        assert_eq!(record.attempts, 2);
        assert!(record.published_at.is_some());
        assert_eq!(broker.messages("member.events").len(), 1);
    }

    fn published_seqs(broker: &InMemoryBroker) -> Vec<u32> {
        broker
            .messages("member.events")
            .iter()
            .map(|m| serde_json::from_slice::<MemberJoined>(&m.payload).unwrap().seq)
            .collect()
    }

    #[tokio::test]
    async fn test_interleaved_writers_publish_in_write_order() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let relay = relay(&store, &broker, fast_config());

        let mut first = store.begin();
        write_event(&mut first, &Event::new("m1", MemberJoined { member_id: "m1".into(), seq: 1 }))
            .await
            .unwrap();

        let second = tokio::spawn({
            let store = store.clone();
            async move {
                let mut tx = store.begin();
                write_event(&mut tx, &Event::new("m1", MemberJoined { member_id: "m1".into(), seq: 2 }))
                    .await
                    .unwrap();
                tx.commit();
            }
        });

        // the second writer waits for m1 while the first transaction is open
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        assert_eq!(relay.run_once().await.unwrap().claimed, 0);

        first.commit();
        second.await.unwrap();
        relay.run_once().await.unwrap();

        assert_eq!(published_seqs(&broker), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_relay_skips_aggregate_with_open_writer() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let relay = relay(&store, &broker, fast_config());
        commit_event(&store, "m1", 1).await;
        commit_event(&store, "m2", 1).await;

        let mut open = store.begin();
        write_event(&mut open, &Event::new("m1", MemberJoined { member_id: "m1".into(), seq: 2 }))
            .await
            .unwrap();

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(broker.messages("member.events")[0].key.as_deref(), Some("m2"));

        open.commit();
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(published_seqs(&broker), vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_crash_before_finish_redelivers() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let id = commit_event(&store, "m1", 1).await;

        // Relay sent the record, then died before recording it
        {
            let claim = store.claim_pending(10, None).await.unwrap();
            let relay = relay(&store, &broker, fast_config());
            broker.send(&relay.message_for(&claim.records()[0])).await.unwrap();
            drop(claim);
        }
        assert!(store.record(id).unwrap().is_pending());

        relay(&store, &broker, fast_config()).run_once().await.unwrap();

        let sent = broker.messages("member.events");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].header(headers::EVENT_ID), sent[1].header(headers::EVENT_ID));
        assert!(store.record(id).unwrap().published_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_defers_only_its_own_aggregate() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let relay = relay(&store, &broker, fast_config());
        commit_event(&store, "a", 1).await;
        commit_event(&store, "a", 2).await;
        commit_event(&store, "b", 1).await;
        broker.fail_next_sends(1);

        let report = relay.run_once().await.unwrap();
        assert_eq!(
            report,
            RelayReport {
                claimed: 3,
                published: 1,
                failed: 1,
                deferred: 1
            }
        );

        relay.run_once().await.unwrap();

        let order: Vec<(String, u32)> = broker
            .messages("member.events")
            .iter()
            .map(|m| {
                let body: MemberJoined = serde_json::from_slice(&m.payload).unwrap();
                (body.member_id, body.seq)
            })
            .collect();
        assert_eq!(
            order,
            vec![("b".to_string(), 1), ("a".to_string(), 1), ("a".to_string(), 2)]
        );
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_records_are_reported_stuck() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let relay = relay(
            &store,
            &broker,
            RelayConfig {
                max_attempts: Some(1),
                ..fast_config()
            },
        );
        let id = commit_event(&store, "m1", 1).await;
        broker.fail_next_sends(1);

        relay.run_once().await.unwrap();
        let report = relay.run_once().await.unwrap();

        assert_eq!(report.claimed, 0);
        let stats = store.stats(Some(1)).await.unwrap();
        assert_eq!(stats.stuck, 1);
        // never deleted
        assert!(store.record(id).is_some());
    }

    #[tokio::test]
    async fn test_prune_respects_retention() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        commit_event(&store, "m1", 1).await;

        let keep = relay(&store, &broker, fast_config());
        keep.run_once().await.unwrap();
        assert_eq!(keep.prune().await.unwrap(), 0);

        let drop_all = relay(
            &store,
            &broker,
            RelayConfig {
                retention_secs: 0,
                ..fast_config()
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(drop_all.prune().await.unwrap(), 1);
        assert!(store.records().is_empty());
    }

    /// Forwards to an in-memory broker and cancels `token` after the first send.
    struct CancelAfterFirstSend {
        inner: InMemoryBroker,
        token: CancellationToken,
    }

    #[async_trait::async_trait]
    impl MessageBroker for CancelAfterFirstSend {
        async fn send(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
            self.inner.send(message).await?;
            self.token.cancel();
            Ok(())
        }

        async fn subscribe(
            &self,
            topics: &[String],
            group: &str,
        ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
            self.inner.subscribe(topics, group).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_batch_between_records() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let token = CancellationToken::new();
        let first = commit_event(&store, "m1", 1).await;
        let second = commit_event(&store, "m2", 1).await;
        let third = commit_event(&store, "m3", 1).await;

        let relay = OutboxRelay::new(
            Arc::new(store.clone()),
            Arc::new(CancelAfterFirstSend {
                inner: broker.clone(),
                token: token.clone(),
            }),
            fast_config(),
        );
        let report = relay.run_batch(&token).await.unwrap();

        assert_eq!(report.claimed, 3);
        assert_eq!(report.published, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(broker.messages("member.events").len(), 1);
        assert!(store.record(first).unwrap().published_at.is_some());
        assert!(store.record(second).unwrap().is_pending());
        assert!(store.record(third).unwrap().is_pending());

        // the claim was finished, so the rest is claimable right away
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 2);
    }

    #[tokio::test]
    async fn test_run_publishes_until_cancelled() {
        let store = InMemoryOutbox::new();
        let broker = InMemoryBroker::new();
        let relay = Arc::new(relay(&store, &broker, fast_config()));
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let relay = relay.clone();
            let token = token.clone();
            async move { relay.run(token).await }
        });

        commit_event(&store, "m1", 1).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.pending_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(relay.check_health().status.is_healthy());
    }

    #[test]
    fn test_topic_strategies() {
        let event = Event::new("m1", MemberJoined { member_id: "m1".into(), seq: 1 });
        let record = OutboxRecord::pending(&event).unwrap();

        assert_eq!(TopicStrategy::default().topic_for(&record), "member.events");
        assert_eq!(TopicStrategy::PerEventType.topic_for(&record), "member.joined");
        assert_eq!(
            TopicStrategy::Fixed { topic: "all".into() }.topic_for(&record),
            "all"
        );
    }
}
