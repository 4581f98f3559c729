use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

use globalpay::attack::{Denial, DenyReason};
use globalpay::payments::ValidationError;
use globalpay::roles::AccessDenied;
use globalpay::{EndpointError, MeteringError, RegistryError, StoreError};

/// Every failure the HTTP surface can report. This is the only place typed
/// results become wire responses.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Request rejected by the abuse detector
    #[error("request screened: {}", .0.reason.code())]
    Screened(Denial),

    /// No API key on a gateway call
    #[error("API key required")]
    MissingApiKey,

    /// Admin bearer token missing or wrong
    #[error("admin authentication required")]
    AdminUnauthorized,

    #[error(transparent)]
    Forbidden(#[from] AccessDenied),

    #[error(transparent)]
    Metering(#[from] MeteringError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Checkout request failed validation
    #[error(transparent)]
    InvalidPayment(#[from] ValidationError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::Registry(RegistryError::Store(e))
    }
}

fn body(error: &str, code: &str, message: impl Into<String>) -> serde_json::Value {
    json!({
        "success": false,
        "error": error,
        "code": code,
        "message": message.into(),
    })
}

fn internal(detail: &dyn std::fmt::Display) -> HttpResponse {
    tracing::error!("Internal error: {}", detail);
    HttpResponse::InternalServerError().json(body(
        "internal_error",
        "INTERNAL_ERROR",
        "An internal error occurred",
    ))
}

fn registry_response(e: &RegistryError) -> HttpResponse {
    match e {
        RegistryError::InvalidKey => HttpResponse::Unauthorized().json(body(
            "unauthorized",
            "INVALID_API_KEY",
            "Invalid API key",
        )),
        RegistryError::Suspended(_) => HttpResponse::Forbidden().json(body(
            "forbidden",
            "CLIENT_SUSPENDED",
            "This API client is suspended",
        )),
        RegistryError::IpNotAllowed => HttpResponse::Forbidden().json(body(
            "forbidden",
            "IP_NOT_ALLOWED",
            "Source address not permitted for this client",
        )),
        RegistryError::OriginNotAllowed => HttpResponse::Forbidden().json(body(
            "forbidden",
            "ORIGIN_NOT_ALLOWED",
            "Origin not permitted for this client",
        )),
        RegistryError::UnknownClient(id) => HttpResponse::NotFound().json(body(
            "not_found",
            "CLIENT_NOT_FOUND",
            format!("Client '{id}' not found"),
        )),
        RegistryError::InvalidProfile(msg) => {
            HttpResponse::BadRequest().json(body("invalid_request", "INVALID_PROFILE", msg.clone()))
        }
        RegistryError::Store(StoreError::Duplicate) => HttpResponse::Conflict().json(body(
            "conflict",
            "DUPLICATE_CLIENT",
            "A client with this identity already exists",
        )),
        RegistryError::Store(e) => internal(e),
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        self.error_response().status()
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::Screened(denial) => {
                let code = denial.reason.code();
                match denial.reason {
                    DenyReason::RateLimited => {
                        let retry_after = denial.retry_after.unwrap_or(1);
                        HttpResponse::TooManyRequests()
                            .insert_header(("Retry-After", retry_after.to_string()))
                            .json(json!({
                                "success": false,
                                "error": "too_many_requests",
                                "code": code,
                                "message": "Too many requests",
                                "retry_after": retry_after,
                            }))
                    }
                    _ => HttpResponse::Forbidden().json(body("forbidden", code, "Request blocked")),
                }
            }
            GatewayError::MissingApiKey => HttpResponse::Unauthorized().json(body(
                "unauthorized",
                "MISSING_API_KEY",
                "Provide an API key via X-API-Key or a Bearer token",
            )),
            GatewayError::AdminUnauthorized => HttpResponse::Unauthorized().json(body(
                "unauthorized",
                "ADMIN_AUTH_REQUIRED",
                "Valid admin Bearer token required",
            )),
            GatewayError::Forbidden(denied) => HttpResponse::Forbidden().json(json!({
                "success": false,
                "error": denied.to_string(),
                "code": denied.code(),
                "required": denied.required,
                "current": denied.current,
            })),
            GatewayError::Metering(e) => match e {
                MeteringError::Unauthorized(e) => registry_response(e),
                MeteringError::UnknownEndpoint { method, path } => {
                    HttpResponse::NotFound().json(body(
                        "not_found",
                        "ENDPOINT_NOT_FOUND",
                        format!("No endpoint for {method:?} {path}"),
                    ))
                }
                MeteringError::RateLimited(limited) => HttpResponse::TooManyRequests()
                    .insert_header(("X-RateLimit-Limit", limited.limit.to_string()))
                    .insert_header(("X-RateLimit-Reset", limited.reset_at.to_string()))
                    .json(json!({
                        "success": false,
                        "error": "too_many_requests",
                        "code": "RATE_LIMIT_EXCEEDED",
                        "message": limited.to_string(),
                        "scope": limited.scope,
                        "limit": limited.limit,
                        "reset_at": limited.reset_at,
                    })),
                MeteringError::Endpoint(EndpointError::InvalidParams(msg)) => HttpResponse::BadRequest()
                    .json(body("invalid_request", "INVALID_PARAMS", msg.clone())),
                MeteringError::Endpoint(e @ EndpointError::Internal(_)) => internal(e),
                MeteringError::Store(e) => internal(e),
            },
            GatewayError::Registry(e) => registry_response(e),
            GatewayError::InvalidPayment(e) => {
                HttpResponse::BadRequest().json(body("invalid_request", "INVALID_PAYMENT", e.to_string()))
            }
            GatewayError::BadRequest(msg) => {
                HttpResponse::BadRequest().json(body("invalid_request", "INVALID_REQUEST", msg.clone()))
            }
            GatewayError::NotFound(msg) => {
                HttpResponse::NotFound().json(body("not_found", "NOT_FOUND", msg.clone()))
            }
            GatewayError::Internal(msg) => internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use globalpay::metering::{RateLimited, RateScope};

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(GatewayError, u16)> = vec![
            (GatewayError::MissingApiKey, 401),
            (GatewayError::Registry(RegistryError::InvalidKey), 401),
            (GatewayError::Registry(RegistryError::Suspended("c".into())), 403),
            (
                GatewayError::Metering(MeteringError::RateLimited(RateLimited {
                    scope: RateScope::TierHour,
                    limit: 1_000,
                    reset_at: 1_708_002_000,
                })),
                429,
            ),
            (
                GatewayError::Metering(MeteringError::Endpoint(EndpointError::InvalidParams(
                    "amount is required".into(),
                ))),
                400,
            ),
            (
                GatewayError::Metering(MeteringError::Endpoint(EndpointError::Internal(
                    "boom".into(),
                ))),
                500,
            ),
            (
                GatewayError::Screened(Denial {
                    reason: DenyReason::MaliciousTool,
                    retry_after: None,
                }),
                403,
            ),
            (GatewayError::from(StoreError::Duplicate), 409),
            (GatewayError::from(ValidationError::InvalidEmail), 400),
        ];
        for (error, status) in cases {
            assert_eq!(error.status_code().as_u16(), status, "{error:?}");
        }
    }

    #[test]
    fn test_screen_rate_limit_sets_retry_after() {
        let response = GatewayError::Screened(Denial {
            reason: DenyReason::RateLimited,
            retry_after: Some(42),
        })
        .error_response();
        assert_eq!(response.status(), 429);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }
}
