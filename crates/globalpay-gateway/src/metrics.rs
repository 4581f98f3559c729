use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Request counters
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("globalpay_requests_total", "Total number of requests"),
        &["method", "route", "status"],
    )
    .expect("valid metric definition")
});

pub static SCREEN_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "globalpay_screen_rejections_total",
            "Requests rejected by the abuse detector, by reason code",
        ),
        &["code"],
    )
    .expect("valid metric definition")
});

// Metered API calls
pub static GATEWAY_CALLS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "globalpay_gateway_calls_total",
            "Metered API calls by endpoint and status",
        ),
        &["endpoint", "status"],
    )
    .expect("valid metric definition")
});

// Payments
pub static PAYMENT_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "globalpay_payment_attempts_total",
            "Payment provider attempts by provider and outcome",
        ),
        &["provider", "outcome"],
    )
    .expect("valid metric definition")
});

pub static PROVIDER_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "globalpay_provider_latency_seconds",
            "Payment provider attempt latency",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0]),
        &["provider"],
    )
    .expect("valid metric definition")
});

pub static PAYMENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "globalpay_payments_total",
            "Payment requests by final outcome code",
        ),
        &["outcome"],
    )
    .expect("valid metric definition")
});

pub static ALL_GATEWAYS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "globalpay_all_gateways_failed_total",
        "Payments for which every eligible provider failed",
    )
    .expect("valid metric definition")
});

/// Register all metrics with the registry
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SCREEN_REJECTIONS.clone()))?;
    REGISTRY.register(Box::new(GATEWAY_CALLS.clone()))?;
    REGISTRY.register(Box::new(PAYMENT_ATTEMPTS.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_LATENCY.clone()))?;
    REGISTRY.register(Box::new(PAYMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALL_GATEWAYS_FAILED.clone()))?;
    Ok(())
}
