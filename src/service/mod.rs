pub mod base;
pub mod health;

pub use base::{EventDrivenService, Service, ServiceError};
pub use health::{ComponentHealth, HealthCheckable, HealthStatus};
