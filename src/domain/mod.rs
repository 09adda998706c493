// ============================================================================
// Domain Layer
// ============================================================================
//
// Domain code only touches the event system through `write_event` inside
// its own transactions, and through typed payloads on the consuming side.
//
// ============================================================================

pub mod customer;
