use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::Value;

use globalpay::{CallerContext, GatewayCall, HttpMethod, MeteringError};

use super::request_region;
use crate::error::GatewayError;
use crate::extract;
use crate::metrics::GATEWAY_CALLS;
use crate::state::AppState;

fn parse_body(body: &[u8]) -> Result<Option<Value>, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))
}

/// GET|POST /api/v1/{tail} - Metered third-party API call
///
/// The key is checked before routing, so an unauthenticated caller learns
/// nothing about which endpoints exist.
pub async fn gateway_call(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let api_key = extract::api_key(req.headers()).ok_or(GatewayError::MissingApiKey)?;
    let method = HttpMethod::parse(req.method().as_str())
        .ok_or_else(|| GatewayError::BadRequest(format!("unsupported method {}", req.method())))?;
    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .map_err(|e| GatewayError::BadRequest(format!("invalid query string: {e}")))?
        .into_inner();
    let body = parse_body(&body)?;
    let region = request_region(&req, &state);
    let ip = extract::client_ip(&req, state.config.trust_proxy_headers);

    let result = state.metering.handle(GatewayCall {
        api_key,
        caller: CallerContext {
            ip: Some(ip),
            origin: extract::origin(req.headers()),
        },
        method,
        path: req.path(),
        query: &query,
        body: body.as_ref(),
        region: &region,
    });

    match result {
        Ok(response) => {
            GATEWAY_CALLS
                .with_label_values(&[response.meta.endpoint, "ok"])
                .inc();
            Ok(HttpResponse::Ok()
                .insert_header((
                    "X-RateLimit-Remaining",
                    response.meta.remaining_requests.to_string(),
                ))
                .json(response))
        }
        Err(e) => {
            let status = match &e {
                MeteringError::Unauthorized(_) => "unauthorized",
                MeteringError::UnknownEndpoint { .. } => "not_found",
                MeteringError::RateLimited(_) => "rate_limited",
                MeteringError::Endpoint(_) => "endpoint_error",
                MeteringError::Store(_) => "store_error",
            };
            GATEWAY_CALLS.with_label_values(&["-", status]).inc();
            Err(e.into())
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/v1/{tail:.*}")
            .route(web::get().to(gateway_call))
            .route(web::post().to(gateway_call)),
    );
}
