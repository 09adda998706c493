// ============================================================================
// Transactional Outbox and Typed Event Bus
// ============================================================================
//
// events    -> event envelope, payload trait, decoding factories
// outbox    -> transactional writer, record store, relay
// messaging -> broker abstraction (Redpanda, in-memory), typed event bus
// service   -> event-driven service base and health reporting
// domain    -> customer domain emitting events through the outbox
// metrics   -> Prometheus metrics and the /metrics, /health server
// utils     -> circuit breaker, exponential backoff
//
// ============================================================================

pub mod config;
pub mod domain;
pub mod events;
pub mod messaging;
pub mod metrics;
pub mod outbox;
pub mod service;
pub mod utils;
