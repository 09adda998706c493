// ============================================================================
// Customer Domain
// ============================================================================
//
// - Value objects (Email, Address)
// - Event payloads emitted through the outbox
// - Repository: domain writes plus outbox rows in one transaction
//
// ============================================================================

pub mod events;
pub mod repository;
pub mod value_objects;

pub use events::*;
pub use repository::{CustomerRepository, NewCustomer, RepositoryError};
pub use value_objects::*;
