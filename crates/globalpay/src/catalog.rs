//! Static configuration loaded once at process start.
//!
//! [`Catalog::builtin`] carries the production defaults. A JSON file with the
//! same shape replaces them wholesale via [`Catalog::from_json_file`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::attack::DetectorPolicy;
use crate::client::{Tier, TierLimits, TierTable};
use crate::endpoints::{EndpointDescriptor, EndpointKind, EndpointRateLimit, HttpMethod};
use crate::error::ConfigError;
use crate::payments::{ProviderDescriptor, GLOBAL_REGION};
use crate::pricing::PricingTable;
use crate::region::{PaymentMethodKind, RegionProfile};
use crate::roles::{PermissionSet, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub regions: Vec<RegionProfile>,
    pub fallback_country: String,
    pub pricing: PricingTable,
    pub roles: Vec<Role>,
    pub tiers: TierTable,
    pub endpoints: Vec<EndpointDescriptor>,
    pub providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub detector: DetectorPolicy,
}

impl Catalog {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn builtin() -> Self {
        Self {
            regions: builtin_regions(),
            fallback_country: "US".to_string(),
            pricing: builtin_pricing(),
            roles: builtin_roles(),
            tiers: builtin_tiers(),
            endpoints: builtin_endpoints(),
            providers: builtin_providers(),
            detector: DetectorPolicy::default(),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn region(
    id: &str,
    countries: &[&str],
    timezone: &str,
    language: &str,
    currency: &str,
    payment_methods: &[PaymentMethodKind],
    tax_rate_bps: u32,
) -> RegionProfile {
    RegionProfile {
        id: id.to_string(),
        countries: strings(countries),
        timezone: timezone.to_string(),
        language: language.to_string(),
        currency: currency.to_string(),
        payment_methods: payment_methods.to_vec(),
        tax_rate_bps,
    }
}

fn builtin_regions() -> Vec<RegionProfile> {
    use PaymentMethodKind::*;
    vec![
        region(
            "us-east-1",
            &["US", "CA", "MX", "PR"],
            "America/New_York",
            "en-US",
            "usd",
            &[Card, Paypal, BankTransfer],
            800,
        ),
        region(
            "sa-east-1",
            &["BR", "AR", "CL", "CO", "PE", "UY", "PY", "BO", "EC", "VE"],
            "America/Sao_Paulo",
            "pt-BR",
            "brl",
            &[Pix, Boleto, Card],
            1_700,
        ),
        region(
            "eu-west-1",
            &[
                "DE", "FR", "ES", "IT", "NL", "BE", "PT", "IE", "AT", "FI", "GR", "LU", "SE",
                "DK", "PL", "CZ", "GB", "CH", "NO",
            ],
            "Europe/Dublin",
            "en-GB",
            "eur",
            &[Card, Sepa, Paypal],
            2_000,
        ),
        region(
            "ap-south-1",
            &["IN", "PK", "BD", "LK", "NP"],
            "Asia/Kolkata",
            "hi-IN",
            "inr",
            &[Upi, Card],
            1_800,
        ),
        region(
            "ap-northeast-1",
            &["JP", "KR", "TW", "HK"],
            "Asia/Tokyo",
            "ja-JP",
            "jpy",
            &[Card, Konbini],
            1_000,
        ),
        region(
            "ap-southeast-1",
            &["SG", "MY", "ID", "TH", "VN", "PH", "AU", "NZ"],
            "Asia/Singapore",
            "en-SG",
            "usd",
            &[Card, Paypal, BankTransfer],
            900,
        ),
        region(
            "af-south-1",
            &["ZA", "NG", "KE", "EG", "GH", "MA"],
            "Africa/Johannesburg",
            "en-ZA",
            "usd",
            &[Card, MobileMoney],
            1_500,
        ),
    ]
}

fn builtin_pricing() -> PricingTable {
    // Prices below are in cents.
    let plan = |prices: &[(&str, i64)]| -> HashMap<String, Decimal> {
        prices
            .iter()
            .map(|(c, cents)| (c.to_string(), Decimal::new(*cents, 2)))
            .collect()
    };
    let plans = HashMap::from([
        (
            "mensal".to_string(),
            plan(&[
                ("usd", 990),
                ("brl", 4_990),
                ("eur", 990),
                ("gbp", 890),
                ("inr", 79_900),
                ("jpy", 148_000),
            ]),
        ),
        (
            "basic".to_string(),
            plan(&[
                ("usd", 2_900),
                ("brl", 14_900),
                ("eur", 2_700),
                ("gbp", 2_400),
                ("inr", 239_900),
                ("jpy", 440_000),
            ]),
        ),
        (
            "pro".to_string(),
            plan(&[
                ("usd", 9_900),
                ("brl", 49_900),
                ("eur", 9_200),
                ("gbp", 7_900),
                ("inr", 799_900),
                ("jpy", 1_480_000),
            ]),
        ),
        (
            "enterprise".to_string(),
            plan(&[("usd", 49_900), ("eur", 45_900)]),
        ),
    ]);
    // Every plan above is priced in usd, so the default-currency invariant holds.
    PricingTable {
        default_currency: "usd".to_string(),
        plans,
    }
}

fn builtin_roles() -> Vec<Role> {
    let viewer = ["view_analytics", "view_campaigns"];
    let editor = [&viewer[..], &["manage_campaigns", "manage_content"][..]].concat();
    let manager = [&editor[..], &["manage_users", "view_billing", "view_security"][..]].concat();
    let admin = [
        &manager[..],
        &["manage_clients", "manage_security", "manage_billing"][..],
    ]
    .concat();

    vec![
        Role {
            name: "viewer".into(),
            level: 10,
            permissions: PermissionSet::only(&viewer),
        },
        Role {
            name: "editor".into(),
            level: 30,
            permissions: PermissionSet::only(&editor),
        },
        Role {
            name: "manager".into(),
            level: 50,
            permissions: PermissionSet::only(&manager),
        },
        Role {
            name: "admin".into(),
            level: 80,
            permissions: PermissionSet::only(&admin),
        },
        Role {
            name: "super_admin".into(),
            level: 100,
            permissions: PermissionSet::all(),
        },
    ]
}

fn builtin_tiers() -> TierTable {
    let limits = |hour, day, month, fee| TierLimits {
        requests_per_hour: hour,
        requests_per_day: day,
        requests_per_month: month,
        monthly_fee: Decimal::new(fee, 2),
    };
    TierTable {
        tiers: HashMap::from([
            (Tier::Free, limits(100, 1_000, 10_000, 0)),
            (Tier::Basic, limits(1_000, 10_000, 100_000, 2_900)),
            (Tier::Professional, limits(5_000, 50_000, 1_000_000, 9_900)),
            (Tier::Enterprise, limits(50_000, 500_000, 10_000_000, 49_900)),
        ]),
    }
}

fn builtin_endpoints() -> Vec<EndpointDescriptor> {
    // Costs below are in millionths of a dollar.
    let endpoint = |kind, method, pattern: &str, category: &str, micros: i64, limit| {
        EndpointDescriptor {
            kind,
            method,
            pattern: pattern.to_string(),
            category: category.to_string(),
            cost: Decimal::new(micros, 6),
            rate_limit: EndpointRateLimit {
                limit,
                window_secs: 60,
            },
        }
    };
    vec![
        endpoint(
            EndpointKind::RegionLookup,
            HttpMethod::Get,
            "/api/v1/regions/{country}",
            "geo",
            500,
            120,
        ),
        endpoint(
            EndpointKind::PriceQuote,
            HttpMethod::Get,
            "/api/v1/pricing/{plan}",
            "pricing",
            1_000,
            600,
        ),
        endpoint(
            EndpointKind::TaxEstimate,
            HttpMethod::Get,
            "/api/v1/tax",
            "pricing",
            1_000,
            300,
        ),
        endpoint(
            EndpointKind::UsageReport,
            HttpMethod::Get,
            "/api/v1/usage",
            "account",
            100,
            300,
        ),
    ]
}

fn builtin_providers() -> Vec<ProviderDescriptor> {
    vec![
        ProviderDescriptor {
            name: "stripe".into(),
            priority: 1,
            regions: strings(&[GLOBAL_REGION]),
            currencies: strings(&["usd", "eur", "gbp", "brl", "inr", "jpy"]),
            timeout_secs: None,
        },
        ProviderDescriptor {
            name: "mercadopago".into(),
            priority: 2,
            regions: strings(&["sa-east-1"]),
            currencies: strings(&["brl"]),
            timeout_secs: None,
        },
        ProviderDescriptor {
            name: "paypal".into(),
            priority: 3,
            regions: strings(&[GLOBAL_REGION]),
            currencies: strings(&["usd", "eur", "gbp", "brl", "jpy"]),
            timeout_secs: None,
        },
    ]
}
