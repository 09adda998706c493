use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::health::{ComponentHealth, HealthCheckable, HealthStatus};
use crate::events::EventFactory;
use crate::messaging::{BusError, EventBus, EventHandler, HandlerRegistration};

// ============================================================================
// Event-driven Service Base
// ============================================================================
//
// A named service that owns one EventBus and the registrations it made on
// it. The service is started once: a second start, also after stop, is
// rejected so a consumer group never gets two loops from one service.
//
// ============================================================================

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `cancellation` fires or `stop` is called.
    async fn start(&self, cancellation: CancellationToken) -> Result<(), ServiceError>;

    async fn stop(&self);

    fn health(&self) -> HealthStatus;
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service '{0}' was already started")]
    AlreadyStarted(String),

    #[error("service has no event bus configured")]
    BusNotConfigured,

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone)]
enum Lifecycle {
    Idle,
    Running(CancellationToken),
    Stopped,
    Failed(String),
}

impl Lifecycle {
    fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Running(_) => "running",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Failed(_) => "failed",
        }
    }
}

pub struct EventDrivenService {
    name: String,
    bus: Option<Arc<EventBus>>,
    // Registrations made through this service, in order
    registry: tokio::sync::Mutex<Vec<HandlerRegistration>>,
    lifecycle: Mutex<Lifecycle>,
}

impl EventDrivenService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bus: None,
            registry: tokio::sync::Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn bus(&self) -> Option<&Arc<EventBus>> {
        self.bus.as_ref()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    pub async fn register_handler<F, H>(&self, factory: F, handler: H) -> Result<HandlerRegistration, ServiceError>
    where
        F: EventFactory,
        H: EventHandler<F::Payload>,
    {
        let name = std::any::type_name::<H>().to_string();
        self.register_handler_named(name, factory, handler).await
    }

    /// Register on the bus, then record it here.
    ///
    /// The registry lock is held across both steps, so a bus-side failure
    /// leaves the registry untouched and no other registration interleaves.
    pub async fn register_handler_named<F, H>(
        &self,
        handler_name: impl Into<String>,
        factory: F,
        handler: H,
    ) -> Result<HandlerRegistration, ServiceError>
    where
        F: EventFactory,
        H: EventHandler<F::Payload>,
    {
        let bus = self.bus.as_ref().ok_or(ServiceError::BusNotConfigured)?;

        let mut registry = self.registry.lock().await;
        let registration = bus.register_handler_named(handler_name, factory, handler).await?;
        registry.push(registration.clone());

        tracing::debug!(
            service = %self.name,
            event_type = %registration.event_type,
            handler = %registration.handler_name,
            "Service handler registered"
        );
        Ok(registration)
    }

    pub async fn handler_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn list_handlers(&self) -> Vec<HandlerRegistration> {
        self.registry.lock().await.clone()
    }
}

#[async_trait]
impl Service for EventDrivenService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, cancellation: CancellationToken) -> Result<(), ServiceError> {
        let bus = self.bus.clone().ok_or(ServiceError::BusNotConfigured)?;

        let token = {
            let mut lifecycle = self.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Idle) {
                tracing::warn!(service = %self.name, state = lifecycle.as_str(), "Start rejected");
                return Err(ServiceError::AlreadyStarted(self.name.clone()));
            }
            let token = cancellation.child_token();
            *lifecycle = Lifecycle::Running(token.clone());
            token
        };

        tracing::info!(service = %self.name, "🚀 Service starting");
        let result = bus.start_consuming(token).await;

        let mut lifecycle = self.lifecycle();
        match result {
            Ok(()) => {
                *lifecycle = Lifecycle::Stopped;
                tracing::info!(service = %self.name, "Service stopped");
                Ok(())
            }
            Err(e) => {
                *lifecycle = Lifecycle::Failed(e.to_string());
                tracing::error!(service = %self.name, error = %e, "Service failed");
                Err(e.into())
            }
        }
    }

    async fn stop(&self) {
        let mut lifecycle = self.lifecycle();
        match &*lifecycle {
            Lifecycle::Running(token) => {
                tracing::info!(service = %self.name, "Stopping service");
                token.cancel();
            }
            Lifecycle::Idle => *lifecycle = Lifecycle::Stopped,
            Lifecycle::Stopped | Lifecycle::Failed(_) => {}
        }
    }

    fn health(&self) -> HealthStatus {
        let Some(bus) = &self.bus else {
            return HealthStatus::Unhealthy("no event bus configured".into());
        };
        if bus.read_topics().is_empty() {
            return HealthStatus::Unhealthy("event bus has no read topics".into());
        }
        match &*self.lifecycle() {
            Lifecycle::Failed(reason) => HealthStatus::Unhealthy(format!("consume loop failed: {}", reason)),
            _ => HealthStatus::Healthy,
        }
    }
}

impl HealthCheckable for EventDrivenService {
    fn check_health(&self) -> ComponentHealth {
        let state = self.lifecycle().as_str();
        ComponentHealth::new(self.name.clone(), self.health()).with_details(format!("state: {}", state))
    }

    fn component_name(&self) -> &str {
        &self.name
    }
}
