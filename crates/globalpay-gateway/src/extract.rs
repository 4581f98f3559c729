//! Pulling gateway inputs out of actix requests.

use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, ACCEPT_LANGUAGE, AUTHORIZATION, ORIGIN, USER_AGENT};
use actix_web::{HttpMessage, HttpRequest};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use globalpay::region::{normalize_country, RegionHints, ResolvedRegion};

/// Country code set by the CDN edge.
pub const EDGE_COUNTRY_HEADER: &str = "CF-IPCountry";
pub const COUNTRY_OVERRIDE_HEADER: &str = "X-Country-Override";
pub const API_KEY_HEADER: &str = "X-API-Key";
pub const ADMIN_ROLE_HEADER: &str = "X-Admin-Role";

/// Region resolved by the screening middleware, stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestRegion(pub Arc<ResolvedRegion>);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn region_hints(headers: &HeaderMap) -> RegionHints {
    RegionHints {
        edge_country: header(headers, EDGE_COUNTRY_HEADER).map(String::from),
        override_country: header(headers, COUNTRY_OVERRIDE_HEADER).map(String::from),
        accept_language: header(headers, ACCEPT_LANGUAGE.as_str()).map(String::from),
    }
}

/// Country for geo screening. Only the edge header counts here: the override
/// header is caller-controlled.
pub fn screening_country(hints: &RegionHints, resolved: &ResolvedRegion) -> String {
    hints
        .edge_country
        .as_deref()
        .and_then(normalize_country)
        .unwrap_or_else(|| resolved.country.clone())
}

pub fn user_agent(headers: &HeaderMap) -> Option<&str> {
    header(headers, USER_AGENT.as_str())
}

pub fn origin(headers: &HeaderMap) -> Option<&str> {
    header(headers, ORIGIN.as_str())
}

/// Source address of the caller. Forwarding headers are only honoured when
/// the gateway sits behind a trusted proxy.
pub fn client_ip(req: &HttpRequest, trust_proxy_headers: bool) -> IpAddr {
    let forwarded = trust_proxy_headers
        .then(|| req.connection_info().realip_remote_addr().map(String::from))
        .flatten()
        .and_then(|raw| parse_ip(&raw));
    forwarded
        .or_else(|| req.peer_addr().map(|a| a.ip()))
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Accepts a bare address or `addr:port` / `[v6]:port`.
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if let Ok(ip) = raw.parse() {
        return Some(ip);
    }
    raw.parse::<std::net::SocketAddr>().ok().map(|s| s.ip())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header(headers, AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// API key from `X-API-Key`, falling back to a Bearer token.
pub fn api_key(headers: &HeaderMap) -> Option<&str> {
    header(headers, API_KEY_HEADER).or_else(|| bearer_token(headers))
}

pub fn admin_role(headers: &HeaderMap) -> Option<&str> {
    header(headers, ADMIN_ROLE_HEADER)
}

pub fn store_region(req: &ServiceRequest, region: ResolvedRegion) {
    req.extensions_mut().insert(RequestRegion(Arc::new(region)));
}

/// Region stored by the screening middleware, if it ran for this request.
pub fn resolved_region(req: &HttpRequest) -> Option<Arc<ResolvedRegion>> {
    req.extensions()
        .get::<RequestRegion>()
        .map(|r| Arc::clone(&r.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_api_key_prefers_header() {
        let req = TestRequest::default()
            .insert_header((API_KEY_HEADER, "gp_live_a"))
            .insert_header(("Authorization", "Bearer gp_live_b"))
            .to_http_request();
        assert_eq!(api_key(req.headers()), Some("gp_live_a"));

        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer gp_live_b"))
            .to_http_request();
        assert_eq!(api_key(req.headers()), Some("gp_live_b"));

        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic abc"))
            .to_http_request();
        assert_eq!(api_key(req.headers()), None);
    }

    #[test]
    fn test_region_hints() {
        let req = TestRequest::default()
            .insert_header((EDGE_COUNTRY_HEADER, "br"))
            .insert_header(("Accept-Language", "pt-BR,pt;q=0.9"))
            .to_http_request();
        let hints = region_hints(req.headers());
        assert_eq!(hints.edge_country.as_deref(), Some("br"));
        assert_eq!(hints.override_country, None);
        assert_eq!(hints.accept_language.as_deref(), Some("pt-BR,pt;q=0.9"));
    }

    #[test]
    fn test_client_ip_ignores_forwarding_unless_trusted() {
        let peer: std::net::SocketAddr = "10.0.0.7:5555".parse().unwrap();
        let req = TestRequest::default()
            .peer_addr(peer)
            .insert_header(("X-Forwarded-For", "203.0.113.9"))
            .to_http_request();
        assert_eq!(client_ip(&req, false), peer.ip());
        assert_eq!(
            client_ip(&req, true),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_ip_with_port() {
        assert_eq!(
            parse_ip("[2001:db8::1]:443"),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(parse_ip("198.51.100.2"), Some("198.51.100.2".parse().unwrap()));
        assert_eq!(parse_ip("unknown"), None);
    }
}
