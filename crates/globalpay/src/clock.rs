//! Time source abstraction.
//!
//! Every bucketed counter in the crate reads time through [`Clock`] so that
//! bucket boundaries can be driven deterministically in tests.

use chrono::{Datelike, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Start of the fixed window of `window_secs` that contains `now`.
pub fn bucket_start(now: i64, window_secs: u64) -> i64 {
    let window = window_secs.max(1) as i64;
    now - now.rem_euclid(window)
}

/// Start of the calendar month (UTC) containing `now`.
pub fn month_start(now: i64) -> i64 {
    let Some(dt) = Utc.timestamp_opt(now, 0).single() else {
        return bucket_start(now, 86_400);
    };
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map(|m| m.timestamp())
        .unwrap_or_else(|| bucket_start(now, 86_400))
}

/// Start of the calendar month (UTC) following the one containing `now`.
pub fn next_month_start(now: i64) -> i64 {
    let Some(dt) = Utc.timestamp_opt(month_start(now), 0).single() else {
        return now + 31 * 86_400;
    };
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|m| m.timestamp())
        .unwrap_or(now + 31 * 86_400)
}
