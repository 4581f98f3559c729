//! Metering gateway: authenticates, rate-limits, executes and bills one
//! third-party API call.
//!
//! A call passes two independent limits. A slot under the client's tier caps
//! (hour, day, month) is reserved in the store first; the endpoint's own fixed
//! window is counted second. Usage and cost are recorded only after the
//! handler returns successfully, as a single store update that also frees the
//! slot. Every other exit gives the slot back.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::client::{ApiClient, Reservation, UsagePeriod, UsagePeriods};
use crate::clock::Clock;
use crate::endpoints::{EndpointDescriptor, EndpointTable, HttpMethod};
use crate::error::{EndpointError, RegistryError, StoreError};
use crate::handlers::{EndpointContext, EndpointHandlers};
use crate::money::cost_string;
use crate::region::ResolvedRegion;
use crate::registry::{CallerContext, ClientRegistry};
use crate::window::RateLimitStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    TierHour,
    TierDay,
    TierMonth,
    Endpoint,
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RateScope::TierHour => "hourly tier limit",
            RateScope::TierDay => "daily tier limit",
            RateScope::TierMonth => "monthly tier limit",
            RateScope::Endpoint => "endpoint limit",
        })
    }
}

impl From<UsagePeriod> for RateScope {
    fn from(period: UsagePeriod) -> Self {
        match period {
            UsagePeriod::Hour => RateScope::TierHour,
            UsagePeriod::Day => RateScope::TierDay,
            UsagePeriod::Month => RateScope::TierMonth,
        }
    }
}

/// A call refused by one of the two limits.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{scope} of {limit} requests exceeded, resets at {reset_at}")]
pub struct RateLimited {
    pub scope: RateScope,
    pub limit: u64,
    /// Unix time at which the exhausted window resets.
    pub reset_at: i64,
}

/// Outcome of a successful limit check. The caller now holds a tier slot
/// and must either record the call or release the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Calls left under the tightest tier cap once this one completes.
    pub remaining_requests: u64,
}

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error(transparent)]
    Unauthorized(#[from] RegistryError),

    #[error("no endpoint mapped for {method:?} {path}")]
    UnknownEndpoint { method: HttpMethod, path: String },

    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("failed to record usage: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    pub endpoint: &'static str,
    pub cost: String,
    pub timestamp: String,
    pub client_id: String,
    pub remaining_requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeteredResponse {
    pub success: bool,
    pub data: Value,
    pub meta: ResponseMeta,
}

/// One inbound gateway call, already stripped of transport details.
#[derive(Clone)]
pub struct GatewayCall<'a> {
    pub api_key: &'a str,
    pub caller: CallerContext<'a>,
    pub method: HttpMethod,
    pub path: &'a str,
    pub query: &'a HashMap<String, String>,
    pub body: Option<&'a Value>,
    pub region: &'a ResolvedRegion,
}

impl fmt::Debug for GatewayCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCall")
            .field("api_key", &"[REDACTED]")
            .field("caller", &self.caller)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub struct MeteringGateway {
    registry: Arc<ClientRegistry>,
    endpoints: Arc<EndpointTable>,
    windows: Arc<dyn RateLimitStore>,
    handlers: EndpointHandlers,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MeteringGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteringGateway")
            .field("registry", &self.registry)
            .field("windows", &self.windows.len())
            .finish()
    }
}

impl MeteringGateway {
    pub fn new(
        registry: Arc<ClientRegistry>,
        endpoints: Arc<EndpointTable>,
        windows: Arc<dyn RateLimitStore>,
        handlers: EndpointHandlers,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            endpoints,
            windows,
            handlers,
            clock,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Reserve a slot under the tier caps, then count the endpoint window.
    /// The endpoint window is only counted once a slot is held, and the slot
    /// is given back when the window refuses the call.
    pub fn check_rate_limit(
        &self,
        client: &ApiClient,
        endpoint: &EndpointDescriptor,
    ) -> Result<Admission, MeteringError> {
        let now = self.clock.now();
        let periods = UsagePeriods::at(now);
        let limits = self.registry.tiers().limits(client.tier).ok_or(RateLimited {
            scope: RateScope::TierHour,
            limit: 0,
            reset_at: periods.hour_resets_at(),
        })?;

        let remaining = match self.registry.store().reserve_call(&client.id, limits, &periods)? {
            Reservation::Granted { remaining } => remaining,
            Reservation::Exhausted(period) => {
                return Err(RateLimited {
                    scope: period.into(),
                    limit: period.limit(limits),
                    reset_at: periods.resets_at(period),
                }
                .into());
            }
        };

        let policy = endpoint.rate_limit;
        let key = format!("client:{}:{}", client.id, endpoint.kind.as_str());
        let hit = self.windows.hit(&key, policy.window_secs, now);
        if hit.count > policy.limit {
            self.release(client);
            return Err(RateLimited {
                scope: RateScope::Endpoint,
                limit: policy.limit,
                reset_at: hit.reset_at,
            }
            .into());
        }

        Ok(Admission {
            remaining_requests: remaining,
        })
    }

    fn release(&self, client: &ApiClient) {
        if let Err(e) = self.registry.store().release_call(&client.id) {
            tracing::warn!(client_id = %client.id, error = %e, "failed to release tier slot");
        }
    }

    pub fn execute(
        &self,
        endpoint: &EndpointDescriptor,
        ctx: EndpointContext<'_>,
    ) -> Result<Value, EndpointError> {
        self.handlers.execute(endpoint.kind, ctx)
    }

    /// Count the call and add its cost. Usage and billing move together.
    pub fn record_usage(
        &self,
        client: &ApiClient,
        endpoint: &EndpointDescriptor,
    ) -> Result<ApiClient, StoreError> {
        let periods = UsagePeriods::at(self.clock.now());
        self.registry.store().record_usage(
            &client.id,
            endpoint.kind.as_str(),
            endpoint.cost,
            &periods,
        )
    }

    /// Full request path: authenticate, route, limit, execute, record.
    pub fn handle(&self, call: GatewayCall<'_>) -> Result<MeteredResponse, MeteringError> {
        let client = self.registry.authorize(call.api_key, call.caller)?;

        let resolved = self
            .endpoints
            .resolve(call.method, call.path)
            .ok_or_else(|| MeteringError::UnknownEndpoint {
                method: call.method,
                path: call.path.to_string(),
            })?;
        let descriptor = resolved.descriptor;

        let admission = self.check_rate_limit(&client, descriptor).inspect_err(|e| {
            if let MeteringError::RateLimited(limited) = e {
                tracing::info!(
                    client_id = %client.id,
                    endpoint = descriptor.kind.as_str(),
                    scope = %limited.scope,
                    reset_at = limited.reset_at,
                    "gateway call rate limited"
                );
            }
        })?;

        let executed = self.execute(
            descriptor,
            EndpointContext {
                client: &client,
                region: call.region,
                path_params: &resolved.path_params,
                query: call.query,
                body: call.body,
            },
        );
        let data = match executed {
            Ok(data) => data,
            Err(e) => {
                self.release(&client);
                return Err(e.into());
            }
        };

        if let Err(e) = self.record_usage(&client, descriptor) {
            self.release(&client);
            return Err(e.into());
        }

        Ok(MeteredResponse {
            success: true,
            data,
            meta: ResponseMeta {
                endpoint: descriptor.kind.as_str(),
                cost: cost_string(descriptor.cost),
                timestamp: chrono::DateTime::from_timestamp(self.clock.now(), 0)
                    .unwrap_or_default()
                    .to_rfc3339(),
                client_id: client.id,
                remaining_requests: admission.remaining_requests,
            },
        })
    }
}
