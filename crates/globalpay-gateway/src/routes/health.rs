use actix_web::{web, HttpRequest, HttpResponse};
use globalpay::crypto::constant_time_eq;

use crate::extract::bearer_token;
use crate::metrics::REGISTRY;
use crate::state::AppState;

/// GET /health - Health check endpoint
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let providers: Vec<&str> = state
        .failover
        .configured()
        .into_iter()
        .map(|d| d.name.as_str())
        .collect();
    let stats = state.detector.stats();

    let mut response = serde_json::json!({
        "status": "ok",
        "service": "globalpay-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": providers,
        "blocked_ips": stats.blocked_ips,
    });

    // Without any payment provider, checkout cannot succeed
    if providers.is_empty() {
        response["status"] = serde_json::json!("degraded");
        response["error"] = serde_json::json!("no payment provider configured");
        HttpResponse::ServiceUnavailable().json(response)
    } else {
        HttpResponse::Ok().json(response)
    }
}

/// GET /metrics - Prometheus metrics endpoint (optionally auth-gated)
pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(ref expected_token) = state.config.metrics_token {
        let authorized = bearer_token(req.headers())
            .map(|token| constant_time_eq(token.as_bytes(), expected_token.as_bytes()))
            .unwrap_or(false);

        if !authorized {
            return HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "unauthorized",
                "message": "Valid Bearer token required for /metrics"
            }));
        }
    }

    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().body("Failed to encode metrics");
    }

    let output = String::from_utf8(buffer).unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(output)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics));
}
