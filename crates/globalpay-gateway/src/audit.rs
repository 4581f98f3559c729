use std::sync::Arc;

use globalpay::payments::{AttemptLog, AttemptSink, PaymentAttemptRecord};

use crate::metrics;

/// Records every provider attempt in the in-memory log, the Prometheus
/// counters and the structured log.
#[derive(Debug, Clone)]
pub struct AuditSink {
    log: Arc<AttemptLog>,
}

impl AuditSink {
    pub fn new(log: Arc<AttemptLog>) -> Self {
        Self { log }
    }
}

impl AttemptSink for AuditSink {
    fn record(&self, attempt: &PaymentAttemptRecord) {
        let outcome = attempt.outcome.as_str();
        metrics::PAYMENT_ATTEMPTS
            .with_label_values(&[attempt.provider.as_str(), outcome])
            .inc();
        metrics::PROVIDER_LATENCY
            .with_label_values(&[attempt.provider.as_str()])
            .observe(attempt.latency_ms as f64 / 1_000.0);

        tracing::info!(
            payment_id = %attempt.payment_id,
            provider = %attempt.provider,
            outcome,
            latency_ms = attempt.latency_ms,
            error = attempt.error.as_deref().unwrap_or(""),
            "payment attempt"
        );

        self.log.record(attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use globalpay::payments::AttemptOutcome;

    #[test]
    fn test_records_reach_the_log() {
        let log = Arc::new(AttemptLog::new(8));
        let sink = AuditSink::new(Arc::clone(&log));
        sink.record(&PaymentAttemptRecord {
            payment_id: "pay_1".into(),
            provider: "stripe".into(),
            outcome: AttemptOutcome::Failed,
            latency_ms: 120,
            error: Some("card declined".into()),
            attempted_at: 1_708_000_000,
        });
        assert_eq!(log.len(), 1);
        assert_eq!(log.for_payment("pay_1")[0].provider, "stripe");
    }
}
