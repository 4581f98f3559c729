use std::sync::Arc;

use actix_web::{middleware::from_fn, middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use globalpay::maintenance::spawn_maintenance;
use globalpay::{Catalog, ClientStore, Clock, SystemClock};
use globalpay_gateway::{
    config::GatewayConfig, cors::build_cors, db::SqliteClientStore, metrics::register_metrics,
    routes, screen::screen_request, state::configured_providers, state::AppState,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = GatewayConfig::from_env().expect("Failed to load configuration");
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();
    let maintenance_interval = config.maintenance_interval;

    tracing::info!("Starting globalpay-gateway on port {}", port);
    let admin_auth = match (config.admin_token.is_some(), config.dev_mode) {
        (true, _) => "bearer token",
        (false, true) => "disabled (dev mode, role header trusted)",
        (false, false) => "no token configured, admin routes reject all requests",
    };
    tracing::info!("Admin auth: {}", admin_auth);
    if config.trust_proxy_headers {
        tracing::info!("Client addresses taken from forwarding headers");
    }

    let catalog = match config.catalog_path {
        Some(ref path) => {
            tracing::info!("Loading catalog from {}", path);
            Catalog::from_json_file(path).expect("Failed to load catalog")
        }
        None => Catalog::builtin(),
    };

    // Initialize database
    let store = SqliteClientStore::open(&config.db_path).expect("Failed to initialize database");
    tracing::info!("Database initialized at: {}", config.db_path);
    let store: Arc<dyn ClientStore> = Arc::new(store);

    let providers = configured_providers(&config).expect("Invalid payment provider settings");
    if providers.is_empty() {
        tracing::warn!("No payment provider credentials configured, checkout is disabled");
    }

    // Register Prometheus metrics
    register_metrics().expect("Failed to register metrics");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(config, catalog, store, providers, Arc::clone(&clock))
        .expect("Failed to build application state");

    for descriptor in state.failover.configured() {
        tracing::info!(
            provider = %descriptor.name,
            priority = descriptor.priority,
            regions = ?descriptor.regions,
            "payment provider enabled"
        );
    }

    let _maintenance = spawn_maintenance(
        Arc::clone(&state.windows),
        Arc::clone(&state.detector),
        clock,
        maintenance_interval,
    );

    let state_data = web::Data::new(state);

    // Start HTTP server
    HttpServer::new(move || {
        let cors = build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .app_data(routes::json_config())
            .wrap(from_fn(screen_request))
            .wrap(Logger::default())
            .wrap(cors)
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
