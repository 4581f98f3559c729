//! Request screening middleware, mounted with `actix_web::middleware::from_fn`.
//!
//! Every request except health checks and metric scrapes passes through the
//! attack detector before routing. The caller's region is resolved here once
//! and stored in the request extensions for handlers to reuse.

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::{Method, StatusCode};
use actix_web::middleware::Next;
use actix_web::{web, Error, HttpRequest, ResponseError};

use globalpay::attack::{InboundRequest, Verdict};

use crate::error::GatewayError;
use crate::extract;
use crate::metrics::{REQUESTS_TOTAL, SCREEN_REJECTIONS};
use crate::state::AppState;

const UNSCREENED_PATHS: &[&str] = &["/health", "/metrics"];

fn route_label(req: &HttpRequest) -> String {
    req.match_pattern().unwrap_or_else(|| "unmatched".to_string())
}

fn count_request(method: &Method, route: &str, status: StatusCode) {
    REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), route, status.as_str()])
        .inc();
}

/// Hand the request to the rest of the chain and count it, including when
/// the chain fails with an error instead of a response.
async fn forward(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    let method = req.method().clone();
    let route = route_label(req.request());
    match next.call(req).await {
        Ok(res) => {
            count_request(&method, &route, res.status());
            Ok(res.map_into_boxed_body())
        }
        Err(e) => {
            count_request(&method, &route, e.as_response_error().status_code());
            Err(e)
        }
    }
}

pub async fn screen_request(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    if UNSCREENED_PATHS.contains(&req.path()) {
        return forward(req, next).await;
    }

    let Some(state) = req.app_data::<web::Data<AppState>>().cloned() else {
        tracing::error!("screening middleware mounted without application state");
        let response = GatewayError::Internal("application state missing".into()).error_response();
        return Ok(req.into_response(response));
    };

    let hints = extract::region_hints(req.headers());
    let region = state.regions.resolve(&hints);
    let country = extract::screening_country(&hints, &region);
    let ip = extract::client_ip(req.request(), state.config.trust_proxy_headers);

    let verdict = state.detector.screen(&InboundRequest {
        ip,
        path: req.path(),
        query: Some(req.query_string()).filter(|q| !q.is_empty()),
        user_agent: extract::user_agent(req.headers()),
        country: &country,
    });

    match verdict {
        Verdict::Allow => {
            extract::store_region(&req, region);
            forward(req, next).await
        }
        Verdict::Deny(denial) => {
            let code = denial.reason.code();
            SCREEN_REJECTIONS.with_label_values(&[code]).inc();
            tracing::warn!(
                ip = %ip,
                path = %req.path(),
                country = %country,
                code,
                "request rejected by screening"
            );
            let res = req.into_response(GatewayError::Screened(denial).error_response());
            count_request(res.request().method(), &route_label(res.request()), res.status());
            Ok(res)
        }
    }
}
