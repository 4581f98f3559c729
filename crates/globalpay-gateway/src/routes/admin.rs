//! Administrative routes.
//!
//! The trusted edge authenticates operators and forwards their role in
//! `X-Admin-Role`, together with the shared `ADMIN_TOKEN` as a Bearer token.
//! The token proves the header came from the edge; the role table decides
//! what the operator may do.

use std::net::IpAddr;

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use globalpay::client::ClientSettings;
use globalpay::crypto::constant_time_eq;
use globalpay::NewClient;

use crate::error::GatewayError;
use crate::extract;
use crate::state::AppState;

/// Minimum role level allowed to list blocked addresses.
const VIEW_BLOCKS_LEVEL: u32 = 50;
const SECURITY_ROLES: &[&str] = &["manager", "admin", "super_admin"];
const RECENT_ATTEMPTS: usize = 50;

/// Verify the edge token and return the forwarded role.
fn admin_role<'a>(req: &'a HttpRequest, state: &AppState) -> Result<Option<&'a str>, GatewayError> {
    match state.config.admin_token {
        Some(ref expected) => {
            let authorized = extract::bearer_token(req.headers())
                .map(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()))
                .unwrap_or(false);
            if !authorized {
                return Err(GatewayError::AdminUnauthorized);
            }
        }
        // Dev mode trusts the role header as-is
        None if state.config.dev_mode => {}
        None => return Err(GatewayError::AdminUnauthorized),
    }
    Ok(extract::admin_role(req.headers()))
}

fn require_permission(
    req: &HttpRequest,
    state: &AppState,
    permission: &str,
) -> Result<(), GatewayError> {
    let role = admin_role(req, state)?;
    state.roles.require_permission(role, permission).map_err(|denied| {
        tracing::warn!(role = ?role, permission, "admin request denied");
        GatewayError::Forbidden(denied)
    })
}

/// POST /admin/clients - Register an API client
pub async fn create_client(
    req: HttpRequest,
    body: web::Json<NewClient>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "manage_clients")?;
    let registry = state.metering.registry();
    let credentials = registry.create_client(body.into_inner())?;
    let client = registry.get_client(&credentials.client_id)?;

    Ok(HttpResponse::Created().json(json!({
        "success": true,
        "client": client,
        "credentials": credentials,
        "message": "Store the secret key now; it is not shown again",
    })))
}

/// GET /admin/clients - List API clients
pub async fn list_clients(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "manage_clients")?;
    let clients = state.metering.registry().list_clients()?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "count": clients.len(),
        "clients": clients,
    })))
}

/// POST /admin/clients/{id}/suspend
pub async fn suspend_client(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "manage_clients")?;
    let client = state.metering.registry().suspend_client(&path)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "client": client })))
}

/// POST /admin/clients/{id}/reactivate
pub async fn reactivate_client(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "manage_clients")?;
    let client = state.metering.registry().reactivate_client(&path)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "client": client })))
}

/// POST /admin/clients/{id}/rotate - Issue a new API key
pub async fn rotate_key(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "manage_clients")?;
    let client_id = path.into_inner();
    let api_key = state.metering.registry().rotate_key(&client_id)?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "client_id": client_id,
        "api_key": api_key,
    })))
}

/// POST /admin/clients/{id}/settings
pub async fn update_settings(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<ClientSettings>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "manage_clients")?;
    let client = state
        .metering
        .registry()
        .update_settings(&path, body.into_inner())?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "client": client })))
}

/// GET /admin/clients/{id}/usage - Usage and billing snapshot
pub async fn client_usage(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "view_billing")?;
    let report = state.metering.registry().usage_report(&path)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "usage": report })))
}

#[derive(Debug, Deserialize)]
pub struct BlockedIpPath {
    ip: String,
}

/// GET /admin/blocked-ips
pub async fn blocked_ips(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let role = admin_role(&req, &state)?;
    state.roles.require_minimum_level(role, VIEW_BLOCKS_LEVEL)?;

    let blocked: Vec<serde_json::Value> = state
        .detector
        .blocked_ips()
        .into_iter()
        .map(|(ip, entry)| {
            json!({
                "ip": ip.to_string(),
                "reason": entry.reason.code(),
                "detail": entry.detail,
                "blocked_at": entry.blocked_at,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "count": blocked.len(),
        "blocked_ips": blocked,
    })))
}

/// DELETE /admin/blocked-ips/{ip}
pub async fn unblock_ip(
    req: HttpRequest,
    path: web::Path<BlockedIpPath>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    require_permission(&req, &state, "manage_security")?;
    let ip: IpAddr = path
        .ip
        .parse()
        .map_err(|_| GatewayError::BadRequest(format!("invalid IP address {:?}", path.ip)))?;

    if !state.detector.unblock_ip(&ip) {
        return Err(GatewayError::NotFound(format!("{ip} is not blocked")));
    }
    tracing::info!(ip = %ip, "IP unblocked by administrator");
    Ok(HttpResponse::Ok().json(json!({ "success": true, "ip": ip.to_string() })))
}

/// GET /admin/security/stats - Detector counters and recent payment attempts
pub async fn security_stats(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let role = admin_role(&req, &state)?;
    state.roles.require_role(role, SECURITY_ROLES)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "detector": state.detector.stats(),
        "rate_limit_windows": state.windows.len(),
        "recent_payment_attempts": state.attempts.recent(RECENT_ATTEMPTS),
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .route("/clients", web::post().to(create_client))
            .route("/clients", web::get().to(list_clients))
            .route("/clients/{id}/suspend", web::post().to(suspend_client))
            .route("/clients/{id}/reactivate", web::post().to(reactivate_client))
            .route("/clients/{id}/rotate", web::post().to(rotate_key))
            .route("/clients/{id}/settings", web::post().to(update_settings))
            .route("/clients/{id}/usage", web::get().to(client_usage))
            .route("/blocked-ips", web::get().to(blocked_ips))
            .route("/blocked-ips/{ip}", web::delete().to(unblock_ip))
            .route("/security/stats", web::get().to(security_stats)),
    );
}
