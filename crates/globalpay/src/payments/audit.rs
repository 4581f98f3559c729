use std::collections::VecDeque;
use std::sync::Mutex;

use super::PaymentAttemptRecord;

/// Destination for payment attempt records.
///
/// Called once per provider attempt, on the request path, so implementations
/// must return quickly. Persisting attempts for audit is a matter of
/// implementing this trait over a durable store.
pub trait AttemptSink: Send + Sync {
    fn record(&self, attempt: &PaymentAttemptRecord);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl AttemptSink for NoopSink {
    fn record(&self, _attempt: &PaymentAttemptRecord) {}
}

/// Bounded in-memory ring of the most recent attempts.
#[derive(Debug)]
pub struct AttemptLog {
    capacity: usize,
    entries: Mutex<VecDeque<PaymentAttemptRecord>>,
}

impl AttemptLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1_024))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PaymentAttemptRecord>> {
        self.entries.lock().unwrap_or_else(|e| {
            tracing::error!("attempt log mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Attempts for one payment, oldest first.
    pub fn for_payment(&self, payment_id: &str) -> Vec<PaymentAttemptRecord> {
        self.lock()
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect()
    }

    /// Most recent attempts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<PaymentAttemptRecord> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttemptSink for AttemptLog {
    fn record(&self, attempt: &PaymentAttemptRecord) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(attempt.clone());
    }
}
