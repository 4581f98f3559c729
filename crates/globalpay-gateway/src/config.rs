use std::env;
use std::time::Duration;

use globalpay::payments::{MercadoPagoProvider, PayPalProvider, StripeProvider};
use url::Url;

const DEFAULT_PORT: u16 = 4030;
const DEFAULT_DB_PATH: &str = "./globalpay.db";
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 15;
const DEFAULT_ESCALATION_MULTIPLIER: u64 = 2;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
const MIN_PEPPER_LEN: usize = 32;

/// Credentials and base URL for one payment provider.
#[derive(Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// SQLite database path for client records (`:memory:` allowed)
    pub db_path: String,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// Relaxes CORS and admin-token checks for local development
    pub dev_mode: bool,
    /// Overrides the catalog's fallback country
    pub fallback_country: Option<String>,
    /// Appended to the catalog's geo deny list
    pub geo_deny_list: Vec<String>,
    /// HMAC key used to hash API keys at rest
    pub key_pepper: Vec<u8>,
    /// Bearer token required for /metrics (None = public)
    pub metrics_token: Option<String>,
    /// Bearer token the trusted edge presents alongside the role header
    pub admin_token: Option<String>,
    pub provider_timeout: Duration,
    /// JSON catalog replacing the built-in defaults
    pub catalog_path: Option<String>,
    pub stripe: Option<ProviderSettings>,
    pub mercadopago: Option<ProviderSettings>,
    pub paypal: Option<ProviderSettings>,
    pub escalation_multiplier: u64,
    pub maintenance_interval: Duration,
    /// Take the client address from forwarding headers instead of the socket
    pub trust_proxy_headers: bool,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("allowed_origins", &self.allowed_origins)
            .field("dev_mode", &self.dev_mode)
            .field("fallback_country", &self.fallback_country)
            .field("geo_deny_list", &self.geo_deny_list)
            .field("key_pepper", &"[REDACTED]")
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("provider_timeout", &self.provider_timeout)
            .field("catalog_path", &self.catalog_path)
            .field("stripe", &self.stripe)
            .field("mercadopago", &self.mercadopago)
            .field("paypal", &self.paypal)
            .field("escalation_multiplier", &self.escalation_multiplier)
            .field("maintenance_interval", &self.maintenance_interval)
            .field("trust_proxy_headers", &self.trust_proxy_headers)
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str| {
            get(key)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
        };

        let dev_mode = flag("GLOBALPAY_DEV_MODE");

        let port = parse_number(get("PORT"), "PORT", DEFAULT_PORT)?;
        let db_path = get("DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|s| split_list(&s))
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ]
            });
        if allowed_origins.iter().any(|o| o == "*") && !dev_mode {
            tracing::error!(
                "Wildcard CORS origin '*' is only allowed with GLOBALPAY_DEV_MODE=true. \
                 Specify explicit origins in ALLOWED_ORIGINS."
            );
            return Err(ConfigError::Invalid(
                "wildcard CORS origin '*' is not allowed in production".to_string(),
            ));
        }

        let key_pepper = get("KEY_PEPPER")
            .ok_or(ConfigError::MissingRequired("KEY_PEPPER"))?
            .into_bytes();
        if key_pepper.len() < MIN_PEPPER_LEN {
            tracing::warn!(
                "KEY_PEPPER is too short ({} bytes, minimum {}); \
                 use `openssl rand -hex 32` to generate one",
                key_pepper.len(),
                MIN_PEPPER_LEN
            );
        }

        let metrics_token = get("METRICS_TOKEN");
        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set, /metrics endpoint is publicly accessible");
        }

        let admin_token = get("ADMIN_TOKEN");
        if admin_token.is_none() && !dev_mode {
            tracing::warn!("ADMIN_TOKEN not set, admin endpoints are disabled");
        }

        let provider_timeout = Duration::from_secs(parse_number(
            get("PROVIDER_TIMEOUT_SECS"),
            "PROVIDER_TIMEOUT_SECS",
            DEFAULT_PROVIDER_TIMEOUT_SECS,
        )?);

        let escalation_multiplier = parse_number(
            get("ESCALATION_MULTIPLIER"),
            "ESCALATION_MULTIPLIER",
            DEFAULT_ESCALATION_MULTIPLIER,
        )?;

        let maintenance_interval = Duration::from_secs(
            parse_number(
                get("MAINTENANCE_INTERVAL_SECS"),
                "MAINTENANCE_INTERVAL_SECS",
                DEFAULT_MAINTENANCE_INTERVAL_SECS,
            )?
            .max(1),
        );

        let provider = |token_key: &str,
                        url_key: &str,
                        default_url: &str|
         -> Result<Option<ProviderSettings>, ConfigError> {
            let Some(token) = get(token_key) else {
                return Ok(None);
            };
            let base_url = get(url_key).unwrap_or_else(|| default_url.to_string());
            Url::parse(&base_url).map_err(|_| ConfigError::InvalidUrl(base_url.clone()))?;
            Ok(Some(ProviderSettings { base_url, token }))
        };

        Ok(Self {
            port,
            db_path,
            allowed_origins,
            dev_mode,
            fallback_country: get("FALLBACK_COUNTRY"),
            geo_deny_list: get("GEO_DENY_LIST")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            key_pepper,
            metrics_token,
            admin_token,
            provider_timeout,
            catalog_path: get("CATALOG_PATH"),
            stripe: provider(
                "STRIPE_SECRET_KEY",
                "STRIPE_API_URL",
                StripeProvider::DEFAULT_URL,
            )?,
            mercadopago: provider(
                "MERCADOPAGO_ACCESS_TOKEN",
                "MERCADOPAGO_API_URL",
                MercadoPagoProvider::DEFAULT_URL,
            )?,
            paypal: provider(
                "PAYPAL_CLIENT_TOKEN",
                "PAYPAL_API_URL",
                PayPalProvider::DEFAULT_URL,
            )?,
            escalation_multiplier,
            maintenance_interval,
            trust_proxy_headers: flag("TRUST_PROXY_HEADERS"),
        })
    }

    /// Local configuration with an in-memory database and no providers.
    pub fn development(key_pepper: &[u8]) -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: ":memory:".to_string(),
            allowed_origins: vec!["*".to_string()],
            dev_mode: true,
            fallback_country: None,
            geo_deny_list: Vec::new(),
            key_pepper: key_pepper.to_vec(),
            metrics_token: None,
            admin_token: None,
            provider_timeout: Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS),
            catalog_path: None,
            stripe: None,
            mercadopago: None,
            paypal: None,
            escalation_multiplier: DEFAULT_ESCALATION_MULTIPLIER,
            maintenance_interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            trust_proxy_headers: false,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_number<T: std::str::FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid number for {key}: {value}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Catalog(#[from] globalpay::ConfigError),

    #[error("payment provider {provider}: {source}")]
    Provider {
        provider: &'static str,
        #[source]
        source: globalpay::ProviderError,
    },

    #[error("client store: {0}")]
    Store(#[from] globalpay::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const PEPPER: (&str, &str) = ("KEY_PEPPER", "0123456789abcdef0123456789abcdef");

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[PEPPER])).unwrap();
        assert_eq!(config.port, 4030);
        assert_eq!(config.db_path, "./globalpay.db");
        assert_eq!(config.provider_timeout, Duration::from_secs(15));
        assert_eq!(config.escalation_multiplier, 2);
        assert!(config.stripe.is_none());
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_pepper_is_required() {
        assert!(matches!(
            GatewayConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingRequired("KEY_PEPPER"))
        ));
    }

    #[test]
    fn test_wildcard_origin_requires_dev_mode() {
        assert!(GatewayConfig::from_lookup(lookup(&[PEPPER, ("ALLOWED_ORIGINS", "*")])).is_err());
        let config = GatewayConfig::from_lookup(lookup(&[
            PEPPER,
            ("ALLOWED_ORIGINS", "*"),
            ("GLOBALPAY_DEV_MODE", "true"),
        ]))
        .unwrap();
        assert_eq!(config.allowed_origins, vec!["*"]);
    }

    #[test]
    fn test_provider_credentials_and_lists() {
        let config = GatewayConfig::from_lookup(lookup(&[
            PEPPER,
            ("STRIPE_SECRET_KEY", "sk_test_abc"),
            ("MERCADOPAGO_ACCESS_TOKEN", "TEST-123"),
            ("MERCADOPAGO_API_URL", "http://localhost:9999"),
            ("GEO_DENY_LIST", "kp, ir ,"),
            ("PROVIDER_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        let stripe = config.stripe.as_ref().unwrap();
        assert_eq!(stripe.base_url, StripeProvider::DEFAULT_URL);
        assert_eq!(
            config.mercadopago.as_ref().unwrap().base_url,
            "http://localhost:9999"
        );
        assert!(config.paypal.is_none());
        assert_eq!(config.geo_deny_list, vec!["kp", "ir"]);
        assert_eq!(config.provider_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_number_rejected() {
        assert!(matches!(
            GatewayConfig::from_lookup(lookup(&[PEPPER, ("PORT", "http")])),
            Err(ConfigError::InvalidNumber { key: "PORT", .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = GatewayConfig::from_lookup(lookup(&[
            PEPPER,
            ("STRIPE_SECRET_KEY", "sk_live_supersecret"),
            ("ADMIN_TOKEN", "admin-token-value"),
        ]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk_live_supersecret"));
        assert!(!debug.contains("admin-token-value"));
        assert!(!debug.contains("0123456789abcdef"));
    }
}
