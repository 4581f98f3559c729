use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;

use globalpay::{PaymentOutcome, PaymentRequest};

use super::request_region;
use crate::error::GatewayError;
use crate::metrics::{ALL_GATEWAYS_FAILED, PAYMENTS_TOTAL};
use crate::state::AppState;

/// Seconds a caller should wait before retrying after every provider failed.
const RETRY_AFTER_SECS: u64 = 30;

/// POST /payments - Charge a plan through the eligible providers
///
/// The charge runs on its own task: if the caller disconnects, only this
/// handler is dropped and the attempt sequence still completes and reaches
/// the audit sink.
pub async fn create_payment(
    req: HttpRequest,
    body: web::Json<PaymentRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let region = request_region(&req, &state);
    let request = body.into_inner();
    request.validate()?;

    tracing::info!(
        plan = %request.plan,
        country = %region.country,
        currency = %region.currency,
        "payment requested"
    );

    let failover = Arc::clone(&state.failover);
    let task_region = Arc::clone(&region);
    let outcome = tokio::spawn(async move { failover.process_payment(&request, &task_region).await })
        .await
        .map_err(|e| GatewayError::Internal(format!("payment task failed: {e}")))?;

    let code = outcome.code();
    PAYMENTS_TOTAL
        .with_label_values(&[code.unwrap_or("SUCCEEDED")])
        .inc();

    let response = match outcome {
        PaymentOutcome::Succeeded {
            gateway, payment, ..
        } => HttpResponse::Ok().json(json!({
            "success": true,
            "gateway": gateway,
            "data": payment,
            "region": &*region,
        })),
        PaymentOutcome::AllGatewaysFailed {
            payment_id,
            attempts,
        } => {
            ALL_GATEWAYS_FAILED.inc();
            tracing::error!(
                payment_id = %payment_id,
                attempts = attempts.len(),
                "all payment gateways failed"
            );
            HttpResponse::ServiceUnavailable()
                .insert_header(("Retry-After", RETRY_AFTER_SECS.to_string()))
                .json(json!({
                    "success": false,
                    "error": "All payment gateways failed",
                    "code": code,
                    "payment_id": payment_id,
                    "attempts": attempts.len(),
                    "region": &*region,
                }))
        }
        PaymentOutcome::NoEligibleGateway { currency } => {
            tracing::warn!(
                currency = %currency,
                region = %region.region_id(),
                "no payment gateway serves this region"
            );
            HttpResponse::ServiceUnavailable().json(json!({
                "success": false,
                "error": format!("No payment gateway available for {currency}"),
                "code": code,
                "region": &*region,
            }))
        }
        PaymentOutcome::PlanNotFound { plan } => HttpResponse::NotFound().json(json!({
            "success": false,
            "error": format!("Unknown plan '{plan}'"),
            "code": code,
            "region": &*region,
        })),
    };
    Ok(response)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/payments", web::post().to(create_payment));
}
