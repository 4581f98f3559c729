use std::sync::Arc;

use globalpay::attack::AttackDetector;
use globalpay::payments::{
    AttemptLog, FailoverManager, MercadoPagoProvider, PayPalProvider, PaymentProvider,
    ProviderClient, StripeProvider,
};
use globalpay::{
    Catalog, ClientRegistry, ClientStore, Clock, EndpointHandlers, EndpointTable,
    InMemoryRateLimitStore, MeteringGateway, RateLimitStore, RegionTable, RoleTable,
};

use crate::audit::AuditSink;
use crate::config::{ConfigError, GatewayConfig, ProviderSettings};

/// Attempts kept in memory for the security stats endpoint.
const ATTEMPT_LOG_CAPACITY: usize = 1_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub regions: Arc<RegionTable>,
    pub roles: Arc<RoleTable>,
    pub detector: Arc<AttackDetector>,
    /// Sliding windows shared by the detector (`ip:` keys) and metering
    /// (`client:` keys).
    pub windows: Arc<dyn RateLimitStore>,
    pub metering: Arc<MeteringGateway>,
    pub failover: Arc<FailoverManager>,
    pub attempts: Arc<AttemptLog>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Build every table from the catalog, applying environment overrides.
    pub fn new(
        config: GatewayConfig,
        mut catalog: Catalog,
        store: Arc<dyn ClientStore>,
        providers: Vec<Arc<dyn PaymentProvider>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if let Some(ref country) = config.fallback_country {
            catalog.fallback_country = country.clone();
        }
        for code in &config.geo_deny_list {
            if !catalog
                .detector
                .geo_deny_list
                .iter()
                .any(|c| c.eq_ignore_ascii_case(code))
            {
                catalog.detector.geo_deny_list.push(code.clone());
            }
        }
        catalog.detector.escalation_multiplier = config.escalation_multiplier;

        let regions = Arc::new(RegionTable::new(catalog.regions, &catalog.fallback_country)?);
        let roles = Arc::new(RoleTable::new(catalog.roles)?);
        let endpoints = Arc::new(EndpointTable::new(catalog.endpoints)?);
        let pricing = Arc::new(catalog.pricing);

        let windows: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        let detector = Arc::new(AttackDetector::new(
            catalog.detector,
            Arc::clone(&windows),
            Arc::clone(&clock),
        )?);

        let registry = Arc::new(ClientRegistry::new(
            store,
            catalog.tiers,
            config.key_pepper.clone(),
            Arc::clone(&clock),
        ));
        let handlers =
            EndpointHandlers::new(Arc::clone(&regions), Arc::clone(&pricing), Arc::clone(&clock));
        let metering = Arc::new(MeteringGateway::new(
            registry,
            endpoints,
            Arc::clone(&windows),
            handlers,
            Arc::clone(&clock),
        ));

        let attempts = Arc::new(AttemptLog::new(ATTEMPT_LOG_CAPACITY));
        let failover = Arc::new(FailoverManager::new(
            catalog.providers,
            providers,
            pricing,
            config.provider_timeout,
            Arc::new(AuditSink::new(Arc::clone(&attempts))),
            Arc::clone(&clock),
        ));

        Ok(Self {
            config: Arc::new(config),
            regions,
            roles,
            detector,
            windows,
            metering,
            failover,
            attempts,
            clock,
        })
    }
}

/// Provider implementations for every provider with credentials configured.
pub fn configured_providers(
    config: &GatewayConfig,
) -> Result<Vec<Arc<dyn PaymentProvider>>, ConfigError> {
    let client = |name: &'static str, settings: &ProviderSettings| {
        ProviderClient::new(&settings.base_url, &settings.token, config.provider_timeout)
            .map_err(|source| ConfigError::Provider {
                provider: name,
                source,
            })
    };

    let mut providers: Vec<Arc<dyn PaymentProvider>> = Vec::new();
    if let Some(ref s) = config.stripe {
        providers.push(Arc::new(StripeProvider::new(client(StripeProvider::NAME, s)?)));
    }
    if let Some(ref s) = config.mercadopago {
        providers.push(Arc::new(MercadoPagoProvider::new(client(
            MercadoPagoProvider::NAME,
            s,
        )?)));
    }
    if let Some(ref s) = config.paypal {
        providers.push(Arc::new(PayPalProvider::new(client(PayPalProvider::NAME, s)?)));
    }
    Ok(providers)
}
