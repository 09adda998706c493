// ============================================================================
// Event Model
// ============================================================================
//
// Envelope, payload trait and decoding factories shared by the outbox writer,
// the relay and the typed event bus. No domain-specific code lives here.
//
// ============================================================================

pub mod event;

pub use event::{DecodeError, Event, EventFactory, EventPayload, JsonFactory};
