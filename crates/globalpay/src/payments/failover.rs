use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    AttemptOutcome, AttemptSink, ChargeRequest, PaymentAttemptRecord, PaymentData,
    PaymentOutcome, PaymentProvider, PaymentRequest,
};
use crate::clock::Clock;
use crate::error::ProviderError;
use crate::pricing::PricingTable;
use crate::region::ResolvedRegion;

/// Region id that makes a provider eligible everywhere.
pub const GLOBAL_REGION: &str = "global";

/// Static routing entry for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Lower is tried first.
    pub priority: u32,
    pub regions: Vec<String>,
    pub currencies: Vec<String>,
    /// Per-attempt timeout; the manager default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderDescriptor {
    pub fn serves(&self, region_id: &str, currency: &str) -> bool {
        let region_ok = self
            .regions
            .iter()
            .any(|r| r == GLOBAL_REGION || r == region_id);
        let currency_ok = self
            .currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency));
        region_ok && currency_ok
    }
}

struct Route {
    descriptor: ProviderDescriptor,
    provider: Arc<dyn PaymentProvider>,
    timeout: Duration,
}

/// Routes a payment across eligible providers, one at a time, in priority
/// order. Attempts are never run in parallel: two providers accepting the
/// same charge would bill the payer twice.
pub struct FailoverManager {
    routes: Vec<Route>,
    pricing: Arc<PricingTable>,
    sink: Arc<dyn AttemptSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field(
                "routes",
                &self
                    .routes
                    .iter()
                    .map(|r| (&r.descriptor.name, r.descriptor.priority))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FailoverManager {
    /// Pair descriptors with provider implementations by name. Descriptors
    /// with no implementation (e.g. missing credentials) are skipped.
    pub fn new(
        descriptors: Vec<ProviderDescriptor>,
        providers: Vec<Arc<dyn PaymentProvider>>,
        pricing: Arc<PricingTable>,
        default_timeout: Duration,
        sink: Arc<dyn AttemptSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut routes: Vec<Route> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if routes.iter().any(|r| r.descriptor.name == descriptor.name) {
                tracing::warn!(provider = %descriptor.name, "duplicate provider descriptor ignored");
                continue;
            }
            let Some(provider) = providers.iter().find(|p| p.name() == descriptor.name) else {
                tracing::warn!(provider = %descriptor.name, "provider not configured, skipping");
                continue;
            };
            let timeout = descriptor
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            routes.push(Route {
                provider: Arc::clone(provider),
                descriptor,
                timeout,
            });
        }
        routes.sort_by(|a, b| {
            a.descriptor
                .priority
                .cmp(&b.descriptor.priority)
                .then_with(|| a.descriptor.name.cmp(&b.descriptor.name))
        });

        Self {
            routes,
            pricing,
            sink,
            clock,
        }
    }

    /// Provider names eligible for a region and currency, in attempt order.
    pub fn eligible(&self, region_id: &str, currency: &str) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|r| r.descriptor.serves(region_id, currency))
            .map(|r| r.descriptor.name.as_str())
            .collect()
    }

    pub fn configured(&self) -> Vec<&ProviderDescriptor> {
        self.routes.iter().map(|r| &r.descriptor).collect()
    }

    /// Price the plan for the caller's region, then try eligible providers
    /// until one accepts. The price is resolved exactly once and reused for
    /// every attempt.
    pub async fn process_payment(
        &self,
        request: &PaymentRequest,
        region: &ResolvedRegion,
    ) -> PaymentOutcome {
        let Some(price) = self.pricing.localized_price(&request.plan, &region.currency) else {
            return PaymentOutcome::PlanNotFound {
                plan: request.plan.clone(),
            };
        };

        let charge = ChargeRequest {
            payment_id: format!("pay_{}", uuid::Uuid::new_v4().simple()),
            plan: price.plan.clone(),
            amount: price.amount_value,
            currency: price.currency.clone(),
            country: region.country.clone(),
            region_id: region.region_id().to_string(),
            email: request.email.trim().to_string(),
            payer_name: request.payer.name.trim().to_string(),
            payer_document: request.payer.document.clone(),
        };
        let summary = charge.summary();

        let candidates: Vec<&Route> = self
            .routes
            .iter()
            .filter(|r| r.descriptor.serves(&charge.region_id, &charge.currency))
            .collect();
        if candidates.is_empty() {
            tracing::warn!(summary = ?summary, region = %charge.region_id, "no eligible payment provider");
            return PaymentOutcome::NoEligibleGateway {
                currency: charge.currency,
            };
        }

        let mut attempts = Vec::with_capacity(candidates.len());
        for route in candidates {
            let name = route.descriptor.name.as_str();
            let started = Instant::now();
            let attempted_at = self.clock.now();

            let result = match tokio::time::timeout(route.timeout, route.provider.charge(&charge)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(route.timeout.as_millis() as u64)),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(accepted) => {
                    let record = PaymentAttemptRecord {
                        payment_id: charge.payment_id.clone(),
                        provider: name.to_string(),
                        outcome: AttemptOutcome::Succeeded,
                        latency_ms,
                        error: None,
                        attempted_at,
                    };
                    self.sink.record(&record);
                    attempts.push(record);

                    tracing::info!(
                        provider = name,
                        latency_ms,
                        attempt = attempts.len(),
                        summary = ?summary,
                        "payment accepted"
                    );
                    return PaymentOutcome::Succeeded {
                        gateway: name.to_string(),
                        payment: PaymentData {
                            payment_id: charge.payment_id.clone(),
                            provider_reference: accepted.provider_reference,
                            status: accepted.status,
                            checkout_url: accepted.checkout_url,
                            plan: price.plan,
                            amount: price.amount,
                            currency: price.currency,
                            formatted: price.formatted,
                        },
                        attempts,
                    };
                }
                Err(e) => {
                    let outcome = match e {
                        ProviderError::Timeout(_) => AttemptOutcome::TimedOut,
                        _ => AttemptOutcome::Failed,
                    };
                    tracing::warn!(
                        provider = name,
                        error = %e,
                        latency_ms,
                        summary = ?summary,
                        "payment attempt failed, trying next provider"
                    );
                    let record = PaymentAttemptRecord {
                        payment_id: charge.payment_id.clone(),
                        provider: name.to_string(),
                        outcome,
                        latency_ms,
                        error: Some(e.to_string()),
                        attempted_at,
                    };
                    self.sink.record(&record);
                    attempts.push(record);
                }
            }
        }

        tracing::error!(
            attempts = attempts.len(),
            summary = ?summary,
            "all payment providers failed"
        );
        PaymentOutcome::AllGatewaysFailed {
            payment_id: charge.payment_id,
            attempts,
        }
    }
}
