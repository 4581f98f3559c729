use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::bucket_start;

/// Result of counting one hit against a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Count in the current bucket, including this hit.
    pub count: u64,
    /// Unix time at which the bucket ends and the count resets.
    pub reset_at: i64,
}

/// Trait for rate-limit window storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`) and must never lose
/// increments under concurrent callers for the same key.
pub trait RateLimitStore: Send + Sync {
    /// Atomically count one hit for `key` in the bucket of `window_secs`
    /// containing `now`. A counter left over from an earlier bucket is reset
    /// before the hit is counted.
    fn hit(&self, key: &str, window_secs: u64, now: i64) -> WindowHit;

    /// Current count for `key` without counting a hit.
    fn peek(&self, key: &str, window_secs: u64, now: i64) -> u64;

    /// Drop windows whose bucket has ended. Returns number purged.
    fn purge_expired(&self, now: i64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    bucket_start: i64,
    window_secs: u64,
    count: u64,
}

impl Window {
    fn reset_at(&self) -> i64 {
        self.bucket_start + self.window_secs as i64
    }
}

/// In-memory window store backed by DashMap. Each key is locked only for the
/// duration of its own increment.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    windows: DashMap<String, Window>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn hit(&self, key: &str, window_secs: u64, now: i64) -> WindowHit {
        let start = bucket_start(now, window_secs);
        let window_secs = window_secs.max(1);

        // The entry guard holds the shard lock, so the rollover and the
        // increment are observed together.
        let window = match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut o) => {
                let w = o.get_mut();
                if w.bucket_start != start || w.window_secs != window_secs {
                    *w = Window {
                        bucket_start: start,
                        window_secs,
                        count: 0,
                    };
                }
                w.count += 1;
                *w
            }
            Entry::Vacant(v) => *v.insert(Window {
                bucket_start: start,
                window_secs,
                count: 1,
            }),
        };

        WindowHit {
            count: window.count,
            reset_at: window.reset_at(),
        }
    }

    fn peek(&self, key: &str, window_secs: u64, now: i64) -> u64 {
        let start = bucket_start(now, window_secs);
        self.windows
            .get(key)
            .filter(|w| w.bucket_start == start)
            .map(|w| w.count)
            .unwrap_or(0)
    }

    fn purge_expired(&self, now: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.reset_at() > now);
        before.saturating_sub(self.windows.len())
    }

    fn len(&self) -> usize {
        self.windows.len()
    }
}
