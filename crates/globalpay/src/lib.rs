//! Global API gateway and payment failover core.
//!
//! Everything here is transport-agnostic; the HTTP surface lives in
//! `globalpay-gateway`.
//!
//! # Request path
//!
//! - **Screening** ([`AttackDetector`]) rejects abusive traffic before any
//!   business logic runs
//! - **Metering** ([`MeteringGateway`]) authenticates an API key, routes the
//!   call to an endpoint, enforces tier and endpoint limits and records usage
//! - **Payments** ([`FailoverManager`]) charge a localized price through the
//!   eligible providers in priority order until one succeeds
//!
//! Region, pricing, role, tier and endpoint tables are built once from a
//! [`Catalog`] and shared read-only afterwards.

pub mod attack;
pub mod catalog;
pub mod client;
pub mod client_store;
pub mod clock;
pub mod crypto;
pub mod endpoints;
pub mod error;
pub mod handlers;
pub mod maintenance;
pub mod metering;
pub mod money;
pub mod payments;
pub mod pricing;
pub mod region;
pub mod registry;
pub mod roles;
pub mod window;

pub use attack::{AttackDetector, Denial, DenyReason, DetectorPolicy, InboundRequest, Verdict};
pub use catalog::Catalog;
pub use client::{ApiClient, ClientStatus, Credentials, NewClient, Tier, TierTable, UsageReport};
pub use client_store::{ClientStore, InMemoryClientStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use endpoints::{EndpointKind, EndpointTable, HttpMethod};
pub use error::{ConfigError, EndpointError, ProviderError, RegistryError, StoreError};
pub use handlers::EndpointHandlers;
pub use metering::{GatewayCall, MeteredResponse, MeteringError, MeteringGateway, RateLimited};
pub use payments::{FailoverManager, PaymentOutcome, PaymentProvider, PaymentRequest};
pub use pricing::{LocalizedPrice, PricingTable};
pub use region::{RegionHints, RegionTable, ResolvedRegion};
pub use registry::{CallerContext, ClientRegistry};
pub use roles::{AccessDenied, RoleTable};
pub use window::{InMemoryRateLimitStore, RateLimitStore};
