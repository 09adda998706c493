use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::{Arc, PoisonError, RwLock};

use crate::service::health::{overall_status, ComponentHealth, HealthCheckable, HealthStatus};

/// Components reported by the /health endpoint
#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<Vec<Arc<dyn HealthCheckable>>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: Arc<dyn HealthCheckable>) {
        self.components
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(component);
    }

    pub fn check_all(&self) -> Vec<ComponentHealth> {
        self.components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.check_health())
            .collect()
    }
}

/// Start the metrics HTTP server
/// This should be called in a separate thread/runtime to avoid conflicts
pub async fn start_metrics_server(
    registry: Registry,
    health: HealthRegistry,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(health.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(registry: web::Data<Registry>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(health: web::Data<HealthRegistry>) -> impl Responder {
    let components = health.check_all();
    let status = overall_status(&components);
    let body = serde_json::json!({
        "service": "outbox-bus",
        "status": status,
        "components": components,
    });

    match status {
        HealthStatus::Unhealthy(_) => HttpResponse::ServiceUnavailable().json(body),
        _ => HttpResponse::Ok().json(body),
    }
}
