//! Region resolution.
//!
//! Maps request-level country hints to a [`RegionProfile`]. Resolution is
//! total: unknown or missing countries resolve to the configured fallback.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::money::apply_basis_points;

/// Payment method families a region accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    Pix,
    Boleto,
    Paypal,
    Sepa,
    Upi,
    Konbini,
    MobileMoney,
    BankTransfer,
}

/// Static bundle describing a geographic cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionProfile {
    pub id: String,
    pub countries: Vec<String>,
    pub timezone: String,
    pub language: String,
    pub currency: String,
    pub payment_methods: Vec<PaymentMethodKind>,
    /// Indicative tax rate in basis points (1700 = 17%).
    pub tax_rate_bps: u32,
}

impl RegionProfile {
    /// Indicative tax owed on an amount. `None` on overflow.
    pub fn tax_for(&self, amount: Decimal) -> Option<Decimal> {
        apply_basis_points(amount, self.tax_rate_bps)
    }

    pub fn accepts(&self, method: PaymentMethodKind) -> bool {
        self.payment_methods.contains(&method)
    }
}

/// Request-level hints used to pick a region.
#[derive(Debug, Clone, Default)]
pub struct RegionHints {
    /// Country code supplied by the trusted edge (e.g. `CF-IPCountry`).
    pub edge_country: Option<String>,
    /// Explicit override header; wins over the edge country.
    pub override_country: Option<String>,
    /// Raw `Accept-Language` header, used for display language only.
    pub accept_language: Option<String>,
}

/// Outcome of region resolution for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedRegion {
    pub country: String,
    pub currency: String,
    pub language: String,
    /// True when the hints were absent or unrecognized.
    pub fallback: bool,
    #[serde(rename = "region")]
    pub profile: Arc<RegionProfile>,
}

impl ResolvedRegion {
    pub fn region_id(&self) -> &str {
        &self.profile.id
    }
}

/// Country → region lookup table, immutable after construction.
#[derive(Debug)]
pub struct RegionTable {
    regions: Vec<Arc<RegionProfile>>,
    by_country: HashMap<String, usize>,
    fallback_country: String,
    fallback_index: usize,
}

/// Edge placeholders for "unknown" and "Tor exit".
const UNKNOWN_COUNTRY_CODES: &[&str] = &["XX", "T1"];

impl RegionTable {
    pub fn new(regions: Vec<RegionProfile>, fallback_country: &str) -> Result<Self, ConfigError> {
        let mut by_country = HashMap::new();
        for (index, region) in regions.iter().enumerate() {
            for country in &region.countries {
                let code = normalize_country(country).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "region {} lists invalid country code {country:?}",
                        region.id
                    ))
                })?;
                if by_country.insert(code.clone(), index).is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "country {code} is assigned to more than one region"
                    )));
                }
            }
        }

        let fallback_country = normalize_country(fallback_country).ok_or_else(|| {
            ConfigError::Invalid(format!("invalid fallback country {fallback_country:?}"))
        })?;
        let fallback_index = *by_country.get(&fallback_country).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "fallback country {fallback_country} does not belong to any region"
            ))
        })?;

        Ok(Self {
            regions: regions.into_iter().map(Arc::new).collect(),
            by_country,
            fallback_country,
            fallback_index,
        })
    }

    /// Resolve hints to a region. Never fails.
    pub fn resolve(&self, hints: &RegionHints) -> ResolvedRegion {
        let requested = hints
            .override_country
            .as_deref()
            .and_then(normalize_country)
            .filter(|c| self.by_country.contains_key(c))
            .or_else(|| {
                hints
                    .edge_country
                    .as_deref()
                    .and_then(normalize_country)
                    .filter(|c| self.by_country.contains_key(c))
            });

        let (country, index, fallback) = match requested {
            Some(code) => {
                let index = self.by_country[&code];
                (code, index, false)
            }
            None => (self.fallback_country.clone(), self.fallback_index, true),
        };

        let profile = Arc::clone(&self.regions[index]);
        let language = hints
            .accept_language
            .as_deref()
            .and_then(primary_language)
            .unwrap_or_else(|| profile.language.clone());

        ResolvedRegion {
            country,
            currency: profile.currency.clone(),
            language,
            fallback,
            profile,
        }
    }

    /// Resolve a bare country code.
    pub fn resolve_country(&self, country: &str) -> ResolvedRegion {
        self.resolve(&RegionHints {
            edge_country: Some(country.to_string()),
            ..Default::default()
        })
    }

    pub fn get(&self, region_id: &str) -> Option<&RegionProfile> {
        self.regions
            .iter()
            .find(|r| r.id == region_id)
            .map(|r| r.as_ref())
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionProfile> {
        self.regions.iter().map(|r| r.as_ref())
    }

    pub fn fallback_country(&self) -> &str {
        &self.fallback_country
    }
}

/// Upper-case a two-letter alphabetic country code. Rejects anything else,
/// including the edge's unknown placeholders.
pub fn normalize_country(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    if UNKNOWN_COUNTRY_CODES.contains(&code.as_str()) {
        return None;
    }
    Some(code)
}

/// First language tag of an `Accept-Language` header, e.g. "pt-BR".
fn primary_language(header: &str) -> Option<String> {
    let tag = header.split(',').next()?.split(';').next()?.trim();
    if tag.is_empty() || tag == "*" || tag.len() > 35 {
        return None;
    }
    if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    Some(tag.to_string())
}
