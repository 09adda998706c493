//! PostgreSQL outbox store
//!
//! SQLx implementation of the writer sink and the relay-facing store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{FromRow, Postgres, Row, Transaction};
use uuid::Uuid;

use super::record::{OutboxClaim, OutboxError, OutboxRecord, OutboxSink, OutboxStats, OutboxStore};

pub const OUTBOX_TABLE: &str = "outbox_events";

/// Schema statements, applied in order by `run_migrations`.
pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        aggregate_type TEXT NOT NULL CHECK (aggregate_type <> ''),
        aggregate_id TEXT NOT NULL,
        event_type TEXT NOT NULL CHECK (event_type <> ''),
        payload BYTEA NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        published_at TIMESTAMPTZ,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_published_created
    ON outbox_events (published_at, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_pending_aggregate
    ON outbox_events (aggregate_id, created_at, seq)
    WHERE published_at IS NULL
    "#,
];

/// Row struct for outbox_events queries
struct OutboxRow {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: Vec<u8>,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            created_at: row.created_at,
            published_at: row.published_at,
            attempts: row.attempts,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
        }
    }
}

// ============================================================================
// Writer side: any open Postgres transaction is an outbox sink
// ============================================================================

#[async_trait]
impl<'c> OutboxSink for Transaction<'c, Postgres> {
    async fn insert_outbox_record(&mut self, record: &OutboxRecord) -> Result<(), OutboxError> {
        // Writers of one aggregate commit one at a time, and the relay skips an
        // aggregate while a writer holds it (same key as the claim's try-lock).
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&record.aggregate_id)
            .execute(&mut **self)
            .await?;

        // Stamped after the lock, so it orders after every earlier writer's rows
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_type, aggregate_id, event_type, payload, occurred_at, created_at, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, clock_timestamp(), 0)
            "#,
        )
        .bind(record.id)
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.occurred_at)
        .execute(&mut **self)
        .await?;

        Ok(())
    }
}

// ============================================================================
// Relay side
// ============================================================================

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), OutboxError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!(table = OUTBOX_TABLE, "Outbox migrations applied");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Claim = PgOutboxClaim;

    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: Option<i32>,
    ) -> Result<PgOutboxClaim, OutboxError> {
        let mut tx = self.pool.begin().await?;

        // Row locks are held until the claim commits or is dropped.
        let candidates: Vec<OutboxRecord> = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload, occurred_at,
                   created_at, published_at, attempts, last_error, next_attempt_at
            FROM outbox_events
            WHERE published_at IS NULL
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
              AND ($2::INTEGER IS NULL OR attempts < $2)
            ORDER BY created_at, seq
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit as i64)
        .bind(max_attempts)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(OutboxRecord::from)
        .collect();

        let mut aggregates: Vec<&str> = Vec::new();
        for record in &candidates {
            if !aggregates.contains(&record.aggregate_id.as_str()) {
                aggregates.push(&record.aggregate_id);
            }
        }

        let mut claimed: Vec<Uuid> = Vec::new();
        for aggregate in aggregates {
            // One replica per aggregate at a time
            let acquired: bool =
                sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                    .bind(aggregate)
                    .fetch_one(&mut *tx)
                    .await?;
            if !acquired {
                tracing::debug!(aggregate_id = %aggregate, "Aggregate claimed by another relay, skipping");
                continue;
            }

            let batch: Vec<Uuid> = candidates
                .iter()
                .filter(|r| r.aggregate_id == aggregate)
                .map(|r| r.id)
                .collect();

            // The batch may only start at the head of the aggregate's queue and
            // must not leave holes in it.
            let queue: Vec<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id FROM outbox_events
                WHERE aggregate_id = $1 AND published_at IS NULL
                ORDER BY created_at, seq
                LIMIT $2
                "#,
            )
            .bind(aggregate)
            .bind(batch.len() as i64)
            .fetch_all(&mut *tx)
            .await?;

            claimed.extend(
                batch
                    .iter()
                    .zip(queue.iter())
                    .take_while(|(ours, head)| ours == head)
                    .map(|(ours, _)| *ours),
            );
        }

        let records = candidates
            .into_iter()
            .filter(|r| claimed.contains(&r.id))
            .collect();

        Ok(PgOutboxClaim { tx, records })
    }

    async fn prune_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self, max_attempts: Option<i32>) -> Result<OutboxStats, OutboxError> {
        let (pending, published, stuck, oldest): (i64, i64, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE published_at IS NULL),
                COUNT(*) FILTER (WHERE published_at IS NOT NULL),
                COUNT(*) FILTER (WHERE published_at IS NULL AND $1::INTEGER IS NOT NULL AND attempts >= $1),
                EXTRACT(EPOCH FROM NOW() - MIN(created_at) FILTER (WHERE published_at IS NULL))::BIGINT
            FROM outbox_events
            "#,
        )
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending: pending as u64,
            published: published as u64,
            stuck: stuck as u64,
            oldest_pending_age_secs: oldest,
        })
    }
}

/// A claimed batch bound to its own transaction. Dropping it rolls back.
pub struct PgOutboxClaim {
    tx: Transaction<'static, Postgres>,
    records: Vec<OutboxRecord>,
}

#[async_trait]
impl OutboxClaim for PgOutboxClaim {
    fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    async fn mark_published(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), OutboxError> {
        sqlx::query("UPDATE outbox_events SET published_at = $2, next_attempt_at = NULL WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &mut self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn finish(self) -> Result<(), OutboxError> {
        self.tx.commit().await?;
        Ok(())
    }
}
