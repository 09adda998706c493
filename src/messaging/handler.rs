use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::broker::{headers, Delivery};
use crate::events::{DecodeError, EventFactory};

// ============================================================================
// Handlers
// ============================================================================
//
// A handler is typed over one payload shape. The bus stores bindings of
// (factory, handler) per event_type behind `ErasedBinding`: decoding turns
// raw bytes into the factory's payload and hands back a call that owns it,
// so the dispatch table never needs to downcast.
//
// ============================================================================

/// Where a message came from, passed to every handler invocation
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub event_type: String,
    /// Idempotency key set by the relay
    pub event_id: Option<Uuid>,
    pub aggregate_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    /// Fires when the consume loop is shutting down
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn from_delivery(delivery: &Delivery, event_type: &str, cancellation: CancellationToken) -> Self {
        let message = &delivery.message;
        Self {
            topic: message.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            event_type: event_type.to_string(),
            event_id: message
                .header(headers::EVENT_ID)
                .and_then(|id| Uuid::parse_str(id).ok()),
            aggregate_id: message
                .header(headers::AGGREGATE_ID)
                .map(str::to_string)
                .or_else(|| message.key.clone()),
            occurred_at: message
                .header(headers::OCCURRED_AT)
                .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
                .map(|at| at.with_timezone(&Utc)),
            cancellation,
        }
    }
}

#[async_trait]
pub trait EventHandler<T>: Send + Sync + 'static {
    async fn handle(&self, ctx: HandlerContext, event: T) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> EventHandler<T> for F
where
    T: Send + 'static,
    F: Fn(HandlerContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, event: T) -> anyhow::Result<()> {
        (self)(ctx, event).await
    }
}

/// Bookkeeping entry for one registered handler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerRegistration {
    pub event_type: String,
    pub payload_type: &'static str,
    pub handler_name: String,
    pub registered_at: DateTime<Utc>,
}

pub(crate) type PreparedCall =
    Box<dyn FnOnce(HandlerContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub(crate) trait ErasedBinding: Send + Sync {
    fn registration(&self) -> &HandlerRegistration;

    /// Decode `bytes` for this binding's handler without running it.
    fn prepare(&self, bytes: &[u8]) -> Result<PreparedCall, DecodeError>;
}

pub(crate) struct Binding<F, H> {
    factory: F,
    handler: Arc<H>,
    registration: HandlerRegistration,
}

impl<F, H> Binding<F, H>
where
    F: EventFactory,
    H: EventHandler<F::Payload>,
{
    pub(crate) fn new(factory: F, handler: H, handler_name: String) -> Self {
        let registration = HandlerRegistration {
            event_type: factory.event_type().to_string(),
            payload_type: std::any::type_name::<F::Payload>(),
            handler_name,
            registered_at: Utc::now(),
        };
        Self {
            factory,
            handler: Arc::new(handler),
            registration,
        }
    }
}

impl<F, H> ErasedBinding for Binding<F, H>
where
    F: EventFactory,
    H: EventHandler<F::Payload>,
{
    fn registration(&self) -> &HandlerRegistration {
        &self.registration
    }

    fn prepare(&self, bytes: &[u8]) -> Result<PreparedCall, DecodeError> {
        let payload = self.factory.decode(bytes)?;
        let handler = self.handler.clone();
        Ok(Box::new(move |ctx: HandlerContext| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async move { handler.handle(ctx, payload).await })
        }))
    }
}
