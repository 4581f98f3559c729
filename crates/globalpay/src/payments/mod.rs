//! Payment collection across multiple providers.
//!
//! [`FailoverManager`] prices a plan once for the caller's region, then walks
//! the eligible providers in priority order until one accepts the charge.

mod audit;
mod failover;
mod providers;

pub use audit::{AttemptLog, AttemptSink, NoopSink};
pub use failover::{FailoverManager, ProviderDescriptor, GLOBAL_REGION};
pub use providers::{MercadoPagoProvider, PayPalProvider, ProviderClient, StripeProvider};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ProviderError;
use crate::money::price_string;

/// Why a checkout request was refused before any provider was contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("plan is required")]
    MissingPlan,

    #[error("payer name must be 1-200 characters")]
    InvalidPayerName,

    #[error("a valid contact email is required")]
    InvalidEmail,
}

const MAX_PAYER_NAME_LEN: usize = 200;

/// Checkout request as received from the caller.
#[derive(Clone, Deserialize)]
pub struct PaymentRequest {
    pub plan: String,
    pub payer: Payer,
    pub email: String,
}

#[derive(Clone, Deserialize)]
pub struct Payer {
    pub name: String,
    /// Tax document (CPF, VAT id, ...). Never logged.
    #[serde(default)]
    pub document: Option<String>,
}

impl std::fmt::Debug for PaymentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentRequest")
            .field("plan", &self.plan)
            .field("payer", &"[REDACTED]")
            .field("email", &mask_email(&self.email))
            .finish()
    }
}

impl PaymentRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.plan.trim().is_empty() {
            return Err(ValidationError::MissingPlan);
        }
        if self.payer.name.trim().is_empty() || self.payer.name.len() > MAX_PAYER_NAME_LEN {
            return Err(ValidationError::InvalidPayerName);
        }
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(ValidationError::InvalidEmail),
        }
    }
}

/// A priced, region-bound charge handed to every provider attempt. Built
/// once per payment so each attempt charges the same amount and currency.
#[derive(Clone)]
pub struct ChargeRequest {
    /// Stable id for this payment; providers use it as the idempotency key.
    pub payment_id: String,
    pub plan: String,
    pub amount: Decimal,
    pub currency: String,
    pub country: String,
    pub region_id: String,
    pub email: String,
    pub payer_name: String,
    pub payer_document: Option<String>,
}

impl ChargeRequest {
    pub fn description(&self) -> String {
        format!("Subscription plan {}", self.plan)
    }

    pub fn summary(&self) -> PaymentSummary {
        PaymentSummary {
            payment_id: self.payment_id.clone(),
            plan: self.plan.clone(),
            amount: price_string(self.amount),
            currency: self.currency.clone(),
            country: self.country.clone(),
            email: mask_email(&self.email),
        }
    }
}

impl std::fmt::Debug for ChargeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Same fields the summary exposes; payer identity stays out of logs.
        std::fmt::Debug::fmt(&self.summary(), f)
    }
}

/// Loggable view of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentSummary {
    pub payment_id: String,
    pub plan: String,
    pub amount: String,
    pub currency: String,
    pub country: String,
    /// Masked, e.g. `j***@example.com`.
    pub email: String,
}

/// What a provider returns for an accepted charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderCharge {
    pub provider_reference: String,
    pub status: String,
    /// Where the payer completes the checkout, when the provider hosts it.
    pub checkout_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::TimedOut => "timed_out",
        }
    }
}

/// One provider attempt. Kept in memory for the request and pushed to an
/// [`AttemptSink`] for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentAttemptRecord {
    pub payment_id: String,
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub attempted_at: i64,
}

/// Payment data returned to the caller on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentData {
    pub payment_id: String,
    pub provider_reference: String,
    pub status: String,
    pub checkout_url: Option<String>,
    pub plan: String,
    pub amount: String,
    pub currency: String,
    pub formatted: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded {
        gateway: String,
        payment: PaymentData,
        attempts: Vec<PaymentAttemptRecord>,
    },
    /// Every eligible provider was tried and none accepted the charge.
    AllGatewaysFailed {
        payment_id: String,
        attempts: Vec<PaymentAttemptRecord>,
    },
    /// No configured provider serves this region and currency.
    NoEligibleGateway { currency: String },
    PlanNotFound { plan: String },
}

impl PaymentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PaymentOutcome::Succeeded { .. })
    }

    /// Machine-readable failure code, `None` on success.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            PaymentOutcome::Succeeded { .. } => None,
            PaymentOutcome::AllGatewaysFailed { .. } => Some("ALL_GATEWAYS_FAILED"),
            PaymentOutcome::NoEligibleGateway { .. } => Some("NO_GATEWAY_AVAILABLE"),
            PaymentOutcome::PlanNotFound { .. } => Some("PLAN_NOT_FOUND"),
        }
    }

    pub fn attempts(&self) -> &[PaymentAttemptRecord] {
        match self {
            PaymentOutcome::Succeeded { attempts, .. }
            | PaymentOutcome::AllGatewaysFailed { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// A payment provider's charge flow.
///
/// Implementations must honour `ChargeRequest::payment_id` as an idempotency
/// key so that a repeated attempt never produces a second charge.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn charge(&self, charge: &ChargeRequest) -> Result<ProviderCharge, ProviderError>;
}

/// Mask the local part of an email address: `jane@x.com` -> `j***@x.com`.
pub fn mask_email(email: &str) -> String {
    match email.trim().split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}
