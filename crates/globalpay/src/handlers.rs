//! Business logic behind each metered endpoint.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::client::{ApiClient, UsageReport};
use crate::clock::Clock;
use crate::endpoints::EndpointKind;
use crate::error::EndpointError;
use crate::money::{format_localized, parse_price, price_string};
use crate::pricing::PricingTable;
use crate::region::{normalize_country, RegionTable, ResolvedRegion};

/// Inputs available to a handler for one call.
#[derive(Debug, Clone, Copy)]
pub struct EndpointContext<'a> {
    pub client: &'a ApiClient,
    pub region: &'a ResolvedRegion,
    pub path_params: &'a HashMap<String, String>,
    pub query: &'a HashMap<String, String>,
    pub body: Option<&'a Value>,
}

impl EndpointContext<'_> {
    fn path_param(&self, name: &str) -> Result<&str, EndpointError> {
        self.path_params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| EndpointError::InvalidParams(format!("missing path parameter {name}")))
    }
}

pub struct EndpointHandlers {
    regions: Arc<RegionTable>,
    pricing: Arc<PricingTable>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EndpointHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandlers")
            .field("default_currency", &self.pricing.default_currency())
            .finish_non_exhaustive()
    }
}

impl EndpointHandlers {
    pub fn new(regions: Arc<RegionTable>, pricing: Arc<PricingTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            regions,
            pricing,
            clock,
        }
    }

    pub fn execute(&self, kind: EndpointKind, ctx: EndpointContext<'_>) -> Result<Value, EndpointError> {
        match kind {
            EndpointKind::RegionLookup => self.region_lookup(ctx),
            EndpointKind::PriceQuote => self.price_quote(ctx),
            EndpointKind::TaxEstimate => self.tax_estimate(ctx),
            EndpointKind::UsageReport => self.usage_report(ctx),
        }
    }

    fn region_lookup(&self, ctx: EndpointContext<'_>) -> Result<Value, EndpointError> {
        let country = ctx.path_param("country")?;
        let resolved = self.regions.resolve_country(country);
        to_value(&resolved)
    }

    fn price_quote(&self, ctx: EndpointContext<'_>) -> Result<Value, EndpointError> {
        let plan = ctx.path_param("plan")?;
        let currency = ctx
            .query
            .get("currency")
            .map(String::as_str)
            .unwrap_or(&ctx.region.currency);
        let price = self
            .pricing
            .localized_price(plan, currency)
            .ok_or_else(|| EndpointError::InvalidParams(format!("unknown plan {plan}")))?;
        to_value(&price)
    }

    fn tax_estimate(&self, ctx: EndpointContext<'_>) -> Result<Value, EndpointError> {
        let amount = ctx
            .query
            .get("amount")
            .ok_or_else(|| EndpointError::InvalidParams("amount is required".to_string()))?;
        let amount = parse_price(amount)
            .map_err(|_| EndpointError::InvalidParams(format!("invalid amount {amount:?}")))?;

        let resolved = match ctx.query.get("country") {
            Some(raw) => {
                let code = normalize_country(raw).ok_or_else(|| {
                    EndpointError::InvalidParams(format!("invalid country {raw:?}"))
                })?;
                self.regions.resolve_country(&code)
            }
            None => ctx.region.clone(),
        };

        let profile = &resolved.profile;
        let overflow = || EndpointError::InvalidParams("amount too large".to_string());
        let tax = profile.tax_for(amount).ok_or_else(overflow)?;
        let total = amount.checked_add(tax).ok_or_else(overflow)?;
        Ok(json!({
            "country": resolved.country,
            "region": profile.id,
            "currency": resolved.currency,
            "amount": price_string(amount),
            "tax_rate_bps": profile.tax_rate_bps,
            "tax": price_string(tax),
            "total": price_string(total),
            "formatted_total": format_localized(total, &resolved.currency),
        }))
    }

    fn usage_report(&self, ctx: EndpointContext<'_>) -> Result<Value, EndpointError> {
        to_value(&UsageReport::build(ctx.client, self.clock.now()))
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, EndpointError> {
    serde_json::to_value(value).map_err(|e| EndpointError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::client::{Billing, ClientSettings, ClientStatus, Tier, UsageCounters};
    use crate::clock::ManualClock;

    struct Fixture {
        handlers: EndpointHandlers,
        regions: Arc<RegionTable>,
        client: ApiClient,
    }

    fn fixture() -> Fixture {
        let catalog = Catalog::builtin();
        let regions = Arc::new(RegionTable::new(catalog.regions, &catalog.fallback_country).unwrap());
        let handlers = EndpointHandlers::new(
            regions.clone(),
            Arc::new(catalog.pricing),
            Arc::new(ManualClock::new(1_700_000_000)),
        );
        let client = ApiClient {
            id: "cli_1".into(),
            name: "Acme".into(),
            email: "ops@acme.test".into(),
            tier: Tier::Basic,
            status: ClientStatus::Active,
            created_at: 0,
            key_prefix: "gpk_".into(),
            usage: UsageCounters::default(),
            billing: Billing::default(),
            settings: ClientSettings::default(),
        };
        Fixture {
            handlers,
            regions,
            client,
        }
    }

    fn call(
        f: &Fixture,
        kind: EndpointKind,
        country: &str,
        path: &[(&str, &str)],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, EndpointError> {
        let region = f.regions.resolve_country(country);
        let path_params = path.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let query = query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        f.handlers.execute(
            kind,
            EndpointContext {
                client: &f.client,
                region: &region,
                path_params: &path_params,
                query: &query,
                body,
            },
        )
    }

    #[test]
    fn test_price_quote_uses_region_currency() {
        let f = fixture();
        let v = call(&f, EndpointKind::PriceQuote, "BR", &[("plan", "mensal")], &[], None).unwrap();
        assert_eq!(v["currency"], "brl");
        assert_eq!(v["amount"], "49.90");
        assert_eq!(v["formatted"], "R$ 49,90");

        let v = call(
            &f,
            EndpointKind::PriceQuote,
            "BR",
            &[("plan", "mensal")],
            &[("currency", "usd")],
            None,
        )
        .unwrap();
        assert_eq!(v["currency"], "usd");
    }

    #[test]
    fn test_unknown_plan_is_invalid_params() {
        let f = fixture();
        let err = call(&f, EndpointKind::PriceQuote, "US", &[("plan", "gold")], &[], None).unwrap_err();
        assert!(matches!(err, EndpointError::InvalidParams(_)));
    }

    #[test]
    fn test_tax_estimate() {
        let f = fixture();
        let v = call(
            &f,
            EndpointKind::TaxEstimate,
            "US",
            &[],
            &[("amount", "100.00"), ("country", "br")],
            None,
        )
        .unwrap();
        assert_eq!(v["region"], "sa-east-1");
        assert_eq!(v["tax"], "17.00");
        assert_eq!(v["total"], "117.00");

        let err = call(&f, EndpointKind::TaxEstimate, "US", &[], &[("amount", "1.2.3")], None)
            .unwrap_err();
        assert!(matches!(err, EndpointError::InvalidParams(_)));

        // Half a cent of tax rounds away from zero
        let v = call(&f, EndpointKind::TaxEstimate, "BR", &[], &[("amount", "0.50")], None).unwrap();
        assert_eq!(v["tax"], "0.09");
        assert_eq!(v["total"], "0.59");
    }

    #[test]
    fn test_region_lookup() {
        let f = fixture();
        let v = call(&f, EndpointKind::RegionLookup, "US", &[("country", "de")], &[], None).unwrap();
        assert_eq!(v["country"], "DE");
        assert_eq!(v["region"]["id"], "eu-west-1");
    }

    #[test]
    fn test_usage_report_endpoint() {
        let f = fixture();
        let v = call(&f, EndpointKind::UsageReport, "US", &[], &[], None).unwrap();
        assert_eq!(v["client_id"], "cli_1");
        assert_eq!(v["total"], 0);
    }
}
