use std::sync::Arc;
use std::time::Duration;

use crate::attack::AttackDetector;
use crate::clock::Clock;
use crate::window::RateLimitStore;

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub windows_purged: usize,
    pub detector_entries_purged: usize,
}

/// Expire finished rate-limit windows and age out idle detector state.
/// Each purge walks its map shard by shard, so request paths only ever wait
/// on the shard currently being swept.
pub fn run_maintenance_pass(
    windows: &dyn RateLimitStore,
    detector: &AttackDetector,
    now: i64,
) -> MaintenanceReport {
    MaintenanceReport {
        windows_purged: windows.purge_expired(now),
        detector_entries_purged: detector.purge_stale(now),
    }
}

/// Spawn the periodic maintenance task on the current tokio runtime.
pub fn spawn_maintenance(
    windows: Arc<dyn RateLimitStore>,
    detector: Arc<AttackDetector>,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = run_maintenance_pass(windows.as_ref(), &detector, clock.now());
            if report.windows_purged + report.detector_entries_purged > 0 {
                tracing::debug!(
                    windows = report.windows_purged,
                    detector = report.detector_entries_purged,
                    remaining_windows = windows.len(),
                    "maintenance pass"
                );
            }
        }
    })
}
