//! HTTP surface for the `globalpay` core: request screening, metered
//! third-party API calls, checkout with provider failover and the admin API.

pub mod audit;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod routes;
pub mod screen;
pub mod state;

pub use config::GatewayConfig;
pub use db::SqliteClientStore;
pub use error::GatewayError;
pub use state::AppState;
