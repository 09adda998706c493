use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

use super::record::{OutboxClaim, OutboxError, OutboxRecord, OutboxSink, OutboxStats, OutboxStore};

// ============================================================================
// In-Memory Outbox Store
// ============================================================================
//
// A transactional stand-in for the relational store, used by tests and local
// runs without PostgreSQL. It models the parts the outbox relies on:
// - transactions that stage domain rows and outbox rows, then commit or roll back
// - row-level claims: a claimed record is skipped by every other claim
// - aggregate gating: only the contiguous head of an aggregate's pending queue
//   is handed out, and only to one claim at a time
// - writer serialization: a transaction holds every aggregate it wrote to
//   until it ends; other writers wait and claims skip the aggregate
//
// ============================================================================

#[derive(Default)]
struct State {
    // commit order
    records: Vec<OutboxRecord>,
    rows: HashMap<String, HashMap<String, serde_json::Value>>,
    locked_records: HashSet<Uuid>,
    // held by an open transaction or a claim
    locked_aggregates: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
    unlocked: Arc<Notify>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a transaction.
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            store: self.clone(),
            records: Vec::new(),
            rows: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock().records.clone()
    }

    pub fn record(&self, id: Uuid) -> Option<OutboxRecord> {
        self.lock().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.lock().rows.get(table).and_then(|t| t.get(key)).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().records.iter().filter(|r| r.is_pending()).count()
    }

    fn release(&self, ids: &[Uuid], aggregates: &[String]) {
        {
            let mut state = self.lock();
            for id in ids {
                state.locked_records.remove(id);
            }
            for aggregate in aggregates {
                state.locked_aggregates.remove(aggregate);
            }
        }
        self.unlocked.notify_waiters();
    }

    /// Wait until no other transaction or claim holds `aggregate`, then hold it.
    async fn acquire_aggregate(&self, aggregate: &str) {
        loop {
            let unlocked = self.unlocked.notified();
            let acquired = self.lock().locked_aggregates.insert(aggregate.to_string());
            if acquired {
                return;
            }
            tracing::debug!(aggregate_id = %aggregate, "Waiting for aggregate held by another transaction");
            unlocked.await;
        }
    }
}

fn sort_key(record: &OutboxRecord, position: usize) -> (DateTime<Utc>, usize) {
    (record.created_at, position)
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    type Claim = MemoryClaim;

    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: Option<i32>,
    ) -> Result<MemoryClaim, OutboxError> {
        let now = Utc::now();
        let mut state = self.lock();

        let mut candidates: Vec<(usize, &OutboxRecord)> = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_pending())
            .filter(|(_, r)| !state.locked_records.contains(&r.id))
            .filter(|(_, r)| r.next_attempt_at.map_or(true, |at| at <= now))
            .filter(|(_, r)| max_attempts.map_or(true, |max| r.attempts < max))
            .collect();
        candidates.sort_by_key(|(pos, r)| sort_key(r, *pos));
        candidates.truncate(limit);

        // Aggregates in order of first appearance in the batch
        let mut aggregates: Vec<String> = Vec::new();
        for (_, record) in &candidates {
            if !aggregates.contains(&record.aggregate_id) {
                aggregates.push(record.aggregate_id.clone());
            }
        }

        let mut granted: Vec<String> = Vec::new();
        let mut claimed_ids: HashSet<Uuid> = HashSet::new();
        for aggregate in aggregates {
            if state.locked_aggregates.contains(&aggregate) {
                continue;
            }

            let mut queue: Vec<(usize, &OutboxRecord)> = state
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_pending() && r.aggregate_id == aggregate)
                .collect();
            queue.sort_by_key(|(pos, r)| sort_key(r, *pos));

            let batch = candidates.iter().filter(|(_, r)| r.aggregate_id == aggregate);
            let prefix: Vec<Uuid> = batch
                .zip(queue.iter())
                .take_while(|((_, claimed), (_, head))| claimed.id == head.id)
                .map(|((_, claimed), _)| claimed.id)
                .collect();

            if !prefix.is_empty() {
                claimed_ids.extend(prefix);
                granted.push(aggregate);
            }
        }

        let records: Vec<OutboxRecord> = candidates
            .iter()
            .filter(|(_, r)| claimed_ids.contains(&r.id))
            .map(|(_, r)| (*r).clone())
            .collect();

        for record in &records {
            state.locked_records.insert(record.id);
        }
        for aggregate in &granted {
            state.locked_aggregates.insert(aggregate.clone());
        }

        Ok(MemoryClaim {
            store: self.clone(),
            records,
            aggregates: granted,
            updates: Vec::new(),
            released: false,
        })
    }

    async fn prune_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut state = self.lock();
        let before = state.records.len();
        state
            .records
            .retain(|r| r.published_at.map_or(true, |at| at >= older_than));
        Ok((before - state.records.len()) as u64)
    }

    async fn stats(&self, max_attempts: Option<i32>) -> Result<OutboxStats, OutboxError> {
        let state = self.lock();
        let now = Utc::now();
        let mut stats = OutboxStats::default();

        for record in &state.records {
            if record.is_pending() {
                stats.pending += 1;
                if max_attempts.is_some_and(|max| record.attempts >= max) {
                    stats.stuck += 1;
                }
                let age = (now - record.created_at).num_seconds();
                stats.oldest_pending_age_secs = Some(stats.oldest_pending_age_secs.map_or(age, |a| a.max(age)));
            } else {
                stats.published += 1;
            }
        }

        Ok(stats)
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Staged writes against the in-memory store. Dropping without `commit`
/// discards everything, like a rolled back database transaction.
pub struct MemoryTransaction {
    store: InMemoryOutbox,
    records: Vec<OutboxRecord>,
    rows: Vec<(String, String, serde_json::Value)>,
    aggregates: Vec<String>,
}

impl MemoryTransaction {
    /// Stage a domain row next to the outbox rows.
    pub fn insert_row(&mut self, table: &str, key: &str, value: serde_json::Value) {
        self.rows.push((table.to_string(), key.to_string(), value));
    }

    pub fn staged_records(&self) -> usize {
        self.records.len()
    }

    pub fn commit(mut self) {
        {
            let mut state = self.store.lock();
            for (table, key, value) in self.rows.drain(..) {
                state.rows.entry(table).or_default().insert(key, value);
            }
            state.records.append(&mut self.records);
        }
        // dropping self releases the aggregates
    }

    pub fn rollback(self) {
        tracing::debug!(staged = self.records.len(), "In-memory transaction rolled back");
    }
}

#[async_trait]
impl OutboxSink for MemoryTransaction {
    async fn insert_outbox_record(&mut self, record: &OutboxRecord) -> Result<(), OutboxError> {
        let duplicate = self.records.iter().any(|r| r.id == record.id)
            || self.store.lock().records.iter().any(|r| r.id == record.id);
        if duplicate {
            return Err(OutboxError::Store(format!(
                "duplicate key value violates unique constraint: {}",
                record.id
            )));
        }
        if !self.aggregates.contains(&record.aggregate_id) {
            self.store.acquire_aggregate(&record.aggregate_id).await;
            self.aggregates.push(record.aggregate_id.clone());
        }

        // Stamped after the aggregate is held, so it orders after earlier writers
        let mut record = record.clone();
        record.created_at = Utc::now();
        self.records.push(record);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.aggregates.is_empty() {
            let aggregates = std::mem::take(&mut self.aggregates);
            self.store.release(&[], &aggregates);
        }
    }
}

// ============================================================================
// Claims
// ============================================================================

enum Update {
    Published { id: Uuid, at: DateTime<Utc> },
    Failed { id: Uuid, error: String, next_attempt_at: DateTime<Utc> },
}

pub struct MemoryClaim {
    store: InMemoryOutbox,
    records: Vec<OutboxRecord>,
    aggregates: Vec<String>,
    updates: Vec<Update>,
    released: bool,
}

impl MemoryClaim {
    fn release(&mut self) {
        if !self.released {
            let ids: Vec<Uuid> = self.records.iter().map(|r| r.id).collect();
            self.store.release(&ids, &self.aggregates);
            self.released = true;
        }
    }
}

#[async_trait]
impl OutboxClaim for MemoryClaim {
    fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    async fn mark_published(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), OutboxError> {
        self.updates.push(Update::Published { id, at });
        Ok(())
    }

    async fn mark_failed(
        &mut self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        self.updates.push(Update::Failed {
            id,
            error: error.to_string(),
            next_attempt_at,
        });
        Ok(())
    }

    async fn finish(mut self) -> Result<(), OutboxError> {
        {
            let mut state = self.store.lock();
            for update in self.updates.drain(..) {
                match update {
                    Update::Published { id, at } => {
                        if let Some(r) = state.records.iter_mut().find(|r| r.id == id) {
                            r.published_at = Some(at);
                        }
                    }
                    Update::Failed { id, error, next_attempt_at } => {
                        if let Some(r) = state.records.iter_mut().find(|r| r.id == id) {
                            r.attempts += 1;
                            r.last_error = Some(error);
                            r.next_attempt_at = Some(next_attempt_at);
                        }
                    }
                }
            }
        }
        self.release();
        Ok(())
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        self.release();
    }
}
