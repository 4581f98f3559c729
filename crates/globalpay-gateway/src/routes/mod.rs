pub mod admin;
pub mod api;
pub mod health;
pub mod payments;

use std::sync::Arc;

use actix_web::{web, HttpRequest};
use globalpay::region::ResolvedRegion;

use crate::error::GatewayError;
use crate::extract;
use crate::state::AppState;

/// Region stored by the screening middleware, or resolved from the headers
/// when the route is not screened.
pub(crate) fn request_region(req: &HttpRequest, state: &AppState) -> Arc<ResolvedRegion> {
    extract::resolved_region(req)
        .unwrap_or_else(|| Arc::new(state.regions.resolve(&extract::region_hints(req.headers()))))
}

/// JSON extractor settings: 64 KiB bodies, parse failures as structured 400s.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(65_536)
        .error_handler(|err, _req| GatewayError::BadRequest(err.to_string()).into())
}

/// Mount every route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.configure(health::configure)
        .configure(payments::configure)
        .configure(api::configure)
        .configure(admin::configure);
}
