//! API client records, tiers and usage accounting types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use crate::clock::{bucket_start, month_start, next_month_start};
use crate::error::ConfigError;
use crate::money::{check_bounded, cost_string, price_string, PRICE_DECIMALS};

pub const HOUR_SECS: i64 = 3_600;
pub const DAY_SECS: i64 = 86_400;
pub const BILLING_CYCLE_SECS: i64 = 30 * DAY_SECS;

/// Service levels, ordered from least to most capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Professional,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "professional" => Some(Tier::Professional),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_hour: u64,
    pub requests_per_day: u64,
    pub requests_per_month: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub monthly_fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "HashMap<Tier, TierLimits>", into = "HashMap<Tier, TierLimits>")]
pub struct TierTable {
    pub(crate) tiers: HashMap<Tier, TierLimits>,
}

impl TryFrom<HashMap<Tier, TierLimits>> for TierTable {
    type Error = ConfigError;

    fn try_from(tiers: HashMap<Tier, TierLimits>) -> Result<Self, Self::Error> {
        TierTable::new(tiers)
    }
}

impl From<TierTable> for HashMap<Tier, TierLimits> {
    fn from(table: TierTable) -> Self {
        table.tiers
    }
}

impl TierTable {
    pub fn new(tiers: HashMap<Tier, TierLimits>) -> Result<Self, ConfigError> {
        for tier in [Tier::Free, Tier::Basic, Tier::Professional, Tier::Enterprise] {
            if !tiers.contains_key(&tier) {
                return Err(ConfigError::Invalid(format!(
                    "no limits configured for tier {}",
                    tier.as_str()
                )));
            }
        }
        for (tier, limits) in &tiers {
            if check_bounded(limits.monthly_fee, PRICE_DECIMALS).is_none() {
                return Err(ConfigError::InvalidAmount(format!(
                    "monthly fee {} for tier {}",
                    limits.monthly_fee,
                    tier.as_str()
                )));
            }
        }
        Ok(Self { tiers })
    }

    pub fn limits(&self, tier: Tier) -> Option<&TierLimits> {
        self.tiers.get(&tier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Suspended,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ClientStatus::Active),
            "suspended" => Some(ClientStatus::Suspended),
            _ => None,
        }
    }
}

/// A count tagged with the bucket it belongs to. Reading it from a later
/// bucket yields zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCounter {
    pub bucket: i64,
    pub count: u64,
}

impl PeriodCounter {
    pub fn current(&self, bucket: i64) -> u64 {
        if self.bucket == bucket {
            self.count
        } else {
            0
        }
    }

    pub fn increment(&mut self, bucket: i64) {
        if self.bucket != bucket {
            self.bucket = bucket;
            self.count = 0;
        }
        self.count += 1;
    }
}

/// Bucket identifiers for the hour, day and calendar month containing `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsagePeriods {
    pub now: i64,
    pub hour: i64,
    pub day: i64,
    pub month: i64,
}

impl UsagePeriods {
    pub fn at(now: i64) -> Self {
        Self {
            now,
            hour: bucket_start(now, HOUR_SECS as u64),
            day: bucket_start(now, DAY_SECS as u64),
            month: month_start(now),
        }
    }

    pub fn hour_resets_at(&self) -> i64 {
        self.hour + HOUR_SECS
    }

    pub fn day_resets_at(&self) -> i64 {
        self.day + DAY_SECS
    }

    pub fn month_resets_at(&self) -> i64 {
        next_month_start(self.month)
    }

    pub fn resets_at(&self, period: UsagePeriod) -> i64 {
        match period {
            UsagePeriod::Hour => self.hour_resets_at(),
            UsagePeriod::Day => self.day_resets_at(),
            UsagePeriod::Month => self.month_resets_at(),
        }
    }
}

/// One of the three windows a tier caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePeriod {
    Hour,
    Day,
    Month,
}

impl UsagePeriod {
    pub fn limit(&self, limits: &TierLimits) -> u64 {
        match self {
            UsagePeriod::Hour => limits.requests_per_hour,
            UsagePeriod::Day => limits.requests_per_day,
            UsagePeriod::Month => limits.requests_per_month,
        }
    }
}

/// Result of trying to hold a slot under a client's tier caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The slot is held. `remaining` counts the calls still admissible
    /// under the tightest cap once this one completes.
    Granted { remaining: u64 },
    /// The first cap that had no room.
    Exhausted(UsagePeriod),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub total: u64,
    pub month: PeriodCounter,
    pub day: PeriodCounter,
    pub hour: PeriodCounter,
    pub per_endpoint: BTreeMap<String, u64>,
}

impl UsageCounters {
    pub fn record(&mut self, endpoint: &str, periods: &UsagePeriods) {
        self.total += 1;
        self.month.increment(periods.month);
        self.day.increment(periods.day);
        self.hour.increment(periods.hour);
        *self.per_endpoint.entry(endpoint.to_string()).or_insert(0) += 1;
    }

    /// Admit one more call on top of `in_flight` already reserved ones, or
    /// name the first cap that is full.
    pub fn reserve(&self, limits: &TierLimits, periods: &UsagePeriods, in_flight: u64) -> Reservation {
        let used = [
            (UsagePeriod::Hour, self.hour.current(periods.hour)),
            (UsagePeriod::Day, self.day.current(periods.day)),
            (UsagePeriod::Month, self.month.current(periods.month)),
        ];
        let mut remaining = u64::MAX;
        for (period, count) in used {
            let taken = count.saturating_add(in_flight);
            let limit = period.limit(limits);
            if taken >= limit {
                return Reservation::Exhausted(period);
            }
            remaining = remaining.min(limit - taken - 1);
        }
        Reservation::Granted { remaining }
    }
}

/// Per-request cost accrued in the current 30-day billing cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Billing {
    #[serde(with = "rust_decimal::serde::str")]
    pub period_cost: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub monthly_fee: Decimal,
    pub next_billing_at: i64,
}

impl Billing {
    /// Boundary of the cycle containing `now`, given the stored boundary.
    pub fn cycle_end(next_billing_at: i64, now: i64) -> i64 {
        if now < next_billing_at {
            return next_billing_at;
        }
        let elapsed_cycles = (now - next_billing_at) / BILLING_CYCLE_SECS + 1;
        next_billing_at + elapsed_cycles * BILLING_CYCLE_SECS
    }

    /// Cost and boundary as they read at `now`. A lapsed cycle reads as empty.
    pub fn current(&self, now: i64) -> (Decimal, i64) {
        if now < self.next_billing_at {
            (self.period_cost, self.next_billing_at)
        } else {
            (Decimal::ZERO, Self::cycle_end(self.next_billing_at, now))
        }
    }

    /// Add one call's cost, starting a fresh cycle first when the previous
    /// one has lapsed.
    pub fn accrue(&mut self, cost: Decimal, now: i64) {
        let (period_cost, next_billing_at) = self.current(now);
        self.period_cost = period_cost + cost;
        self.next_billing_at = next_billing_at;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub webhook_url: Option<String>,
    /// Empty means any source address.
    #[serde(default)]
    pub ip_allow_list: Vec<IpAddr>,
    /// Empty means any origin.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiClient {
    pub id: String,
    pub name: String,
    pub email: String,
    pub tier: Tier,
    pub status: ClientStatus,
    pub created_at: i64,
    /// Leading characters of the current API key, for display only.
    pub key_prefix: String,
    pub usage: UsageCounters,
    pub billing: Billing,
    pub settings: ClientSettings,
}

/// A client as persisted: the public record plus credential hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client: ApiClient,
    pub api_key_hash: String,
    pub secret_hash: String,
}

/// Registration input.
#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    pub email: String,
    pub tier: Tier,
    #[serde(default)]
    pub settings: ClientSettings,
}

/// Credentials returned exactly once, at creation or rotation.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub client_id: String,
    pub api_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("api_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Usage and billing snapshot as seen at a given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub client_id: String,
    pub tier: Tier,
    pub status: ClientStatus,
    pub total: u64,
    pub this_month: u64,
    pub this_day: u64,
    pub this_hour: u64,
    pub per_endpoint: BTreeMap<String, u64>,
    /// Accumulated per-request cost in usd, decimal string.
    pub period_cost: String,
    pub monthly_fee: String,
    pub next_billing_at: i64,
}

impl UsageReport {
    pub fn build(client: &ApiClient, now: i64) -> Self {
        let periods = UsagePeriods::at(now);
        let (period_cost, next_billing_at) = client.billing.current(now);
        Self {
            client_id: client.id.clone(),
            tier: client.tier,
            status: client.status,
            total: client.usage.total,
            this_month: client.usage.month.current(periods.month),
            this_day: client.usage.day.current(periods.day),
            this_hour: client.usage.hour.current(periods.hour),
            per_endpoint: client.usage.per_endpoint.clone(),
            period_cost: cost_string(period_cost),
            monthly_fee: price_string(client.billing.monthly_fee),
            next_billing_at,
        }
    }
}
