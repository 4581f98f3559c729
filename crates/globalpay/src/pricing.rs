use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ConfigError;
use crate::money::{check_bounded, format_localized, parse_price, price_string, PRICE_DECIMALS};

/// Plan → currency → price table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawPricingTable", into = "RawPricingTable")]
pub struct PricingTable {
    pub(crate) default_currency: String,
    pub(crate) plans: HashMap<String, HashMap<String, Decimal>>,
}

/// Wire form of the pricing table: decimal strings keyed by plan and currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPricingTable {
    pub default_currency: String,
    pub plans: HashMap<String, HashMap<String, String>>,
}

impl TryFrom<RawPricingTable> for PricingTable {
    type Error = ConfigError;

    fn try_from(raw: RawPricingTable) -> Result<Self, Self::Error> {
        let mut plans = HashMap::with_capacity(raw.plans.len());
        for (plan, prices) in raw.plans {
            let mut parsed = HashMap::with_capacity(prices.len());
            for (currency, amount) in prices {
                parsed.insert(currency.to_ascii_lowercase(), parse_price(&amount)?);
            }
            plans.insert(plan, parsed);
        }
        PricingTable::new(&raw.default_currency, plans)
    }
}

impl From<PricingTable> for RawPricingTable {
    fn from(table: PricingTable) -> Self {
        RawPricingTable {
            default_currency: table.default_currency,
            plans: table
                .plans
                .into_iter()
                .map(|(plan, prices)| {
                    let prices = prices
                        .into_iter()
                        .map(|(c, amount)| (c, price_string(amount)))
                        .collect();
                    (plan, prices)
                })
                .collect(),
        }
    }
}

/// A plan price localized for a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalizedPrice {
    pub plan: String,
    /// Decimal string with two fractional digits, e.g. "49.90".
    pub amount: String,
    #[serde(skip)]
    pub amount_value: Decimal,
    pub currency: String,
    pub formatted: String,
    /// True when the requested currency was not priced and the default was used.
    pub fallback: bool,
}

impl PricingTable {
    pub fn new(
        default_currency: &str,
        plans: HashMap<String, HashMap<String, Decimal>>,
    ) -> Result<Self, ConfigError> {
        let default_currency = default_currency.to_ascii_lowercase();
        for (plan, prices) in &plans {
            if let Some((currency, amount)) = prices
                .iter()
                .find(|(_, amount)| check_bounded(**amount, PRICE_DECIMALS).is_none())
            {
                return Err(ConfigError::InvalidAmount(format!("{plan}/{currency}: {amount}")));
            }
            if !prices.contains_key(&default_currency) {
                return Err(ConfigError::Invalid(format!(
                    "plan {plan} has no price in default currency {default_currency}"
                )));
            }
        }
        Ok(Self {
            default_currency,
            plans,
        })
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    pub fn plans(&self) -> impl Iterator<Item = &str> {
        self.plans.keys().map(String::as_str)
    }

    /// Price a plan in the requested currency, falling back to the default
    /// currency when the plan is not priced in it. `None` only for unknown plans.
    pub fn localized_price(&self, plan: &str, currency: &str) -> Option<LocalizedPrice> {
        let prices = self.plans.get(plan)?;
        let requested = currency.to_ascii_lowercase();

        let (currency, amount, fallback) = match prices.get(&requested) {
            Some(amount) => (requested, *amount, false),
            None => {
                let amount = *prices.get(&self.default_currency)?;
                (self.default_currency.clone(), amount, true)
            }
        };

        Some(LocalizedPrice {
            plan: plan.to_string(),
            amount: price_string(amount),
            amount_value: amount,
            formatted: format_localized(amount, &currency),
            currency,
            fallback,
        })
    }
}
