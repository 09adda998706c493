use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use super::broker::{BrokerError, BrokerMessage, BrokerSubscription, Delivery, MessageBroker};

// ============================================================================
// In-Memory Broker
// ============================================================================
//
// One append-only log per topic with a single partition (0), and committed
// offsets per (consumer group, topic). A new subscription resumes from the
// group's committed offset, so anything fetched but not committed is
// delivered again, as with a real broker after a consumer restart.
//
// ============================================================================

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<BrokerMessage>>,
    // (group, topic) -> next offset to consume
    committed: HashMap<(String, String), i64>,
    failing_sends: u32,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` sends fail with a transport error.
    pub fn fail_next_sends(&self, count: u32) {
        self.lock().failing_sends = count;
    }

    /// Every message ever sent to `topic`, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.lock().logs.get(topic).cloned().unwrap_or_default()
    }

    /// Next offset `group` will consume from `topic`, if it committed anything.
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn send(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(BrokerError::Transport("injected send failure".into()));
            }
            state
                .logs
                .entry(message.topic.clone())
                .or_default()
                .push(message.clone());
        }
        self.shared.appended.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
        group: &str,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
        if topics.is_empty() {
            return Err(BrokerError::Configuration("no topics to subscribe to".into()));
        }

        let state = self.lock();
        let cursors = topics
            .iter()
            .map(|topic| {
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.clone()))
                    .copied()
                    .unwrap_or(0);
                (topic.clone(), committed)
            })
            .collect();

        Ok(Box::new(InMemorySubscription {
            broker: self.clone(),
            group: group.to_string(),
            topics: topics.to_vec(),
            cursors,
            closed: false,
        }))
    }
}

pub struct InMemorySubscription {
    broker: InMemoryBroker,
    group: String,
    topics: Vec<String>,
    cursors: HashMap<String, i64>,
    closed: bool,
}

impl InMemorySubscription {
    fn poll_ready(&mut self) -> Option<Delivery> {
        let state = self.broker.lock();
        for topic in &self.topics {
            let cursor = self.cursors.get(topic).copied().unwrap_or(0);
            let message = state
                .logs
                .get(topic)
                .and_then(|log| log.get(cursor as usize))
                .cloned();
            if let Some(message) = message {
                self.cursors.insert(topic.clone(), cursor + 1);
                return Some(Delivery {
                    message,
                    partition: 0,
                    offset: cursor,
                });
            }
        }
        None
    }
}

#[async_trait]
impl BrokerSubscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let shared = self.broker.shared.clone();
        loop {
            if self.closed {
                return None;
            }

            // Register interest before checking so an append in between is not missed
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.poll_ready() {
                return Some(Ok(delivery));
            }
            notified.await;
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let mut state = self.broker.lock();
        let key = (self.group.clone(), delivery.message.topic.clone());
        let next = delivery.offset + 1;
        let committed = state.committed.entry(key).or_insert(0);
        if next > *committed {
            *committed = next;
        }
        Ok(())
    }

    async fn rewind(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.cursors
            .insert(delivery.message.topic.clone(), delivery.offset);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
