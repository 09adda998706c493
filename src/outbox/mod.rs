// ============================================================================
// Transactional Outbox
// ============================================================================
//
// writer   -> appends event rows inside the caller's transaction
// relay    -> drains pending rows to the broker
// postgres -> production store (sqlx)
// memory   -> transactional in-memory store for tests and local runs
//
// ============================================================================

pub mod memory;
pub mod postgres;
pub mod record;
pub mod relay;
pub mod writer;

pub use memory::{InMemoryOutbox, MemoryTransaction};
pub use postgres::PgOutboxStore;
pub use record::{OutboxClaim, OutboxError, OutboxRecord, OutboxSink, OutboxStats, OutboxStore};
pub use relay::{OutboxRelay, RelayConfig, RelayError, RelayReport, TopicStrategy};
pub use writer::{write_event, write_events};
