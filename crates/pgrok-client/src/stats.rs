//! Rolling request statistics
//!
//! Keeps the durations of requests completed in the last five minutes and a
//! count of requests still in flight. Rates and latency percentiles are
//! computed from the window whenever a snapshot is taken.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How long a completed request stays in the window
pub const WINDOW: Duration = Duration::from_secs(5 * 60);

/// Span of the short rate
const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Point-in-time view of the tracker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Requests recorded since the tracker was created
    pub total_requests: u64,
    /// Requests currently being forwarded
    pub open_connections: usize,
    /// Requests per second over the last minute
    pub rate_1m: f64,
    /// Requests per second over the last five minutes
    pub rate_5m: f64,
    /// Median duration in milliseconds
    pub p50_ms: f64,
    /// 90th percentile duration in milliseconds
    pub p90_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    duration_ms: f64,
}

/// Request statistics tracker
///
/// Shared between the proxy (which marks requests in flight) and the
/// session, which records completions and publishes snapshots.
#[derive(Debug, Default)]
pub struct StatsTracker {
    total: AtomicU64,
    open: Arc<AtomicUsize>,
    window: Mutex<VecDeque<Sample>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed request
    pub fn record_request(&self, duration_ms: f64) {
        self.record_request_at(duration_ms, Instant::now());
    }

    pub(crate) fn record_request_at(&self, duration_ms: f64, now: Instant) {
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut window = self.window();
        window.push_back(Sample {
            at: now,
            duration_ms,
        });
        prune(&mut window, now);
    }

    /// Mark a request as in flight until the returned guard completes
    pub fn mark_in_flight(&self) -> InFlight {
        self.open.fetch_add(1, Ordering::Relaxed);
        InFlight {
            open: Arc::clone(&self.open),
            done: AtomicBool::new(false),
        }
    }

    /// Number of requests currently in flight
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    /// Compute rates and percentiles from the current window
    pub fn snapshot(&self) -> ConnectionStats {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> ConnectionStats {
        let mut window = self.window();
        prune(&mut window, now);

        let last_minute = window
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) < ONE_MINUTE)
            .count();

        let mut durations: Vec<f64> = window.iter().map(|s| s.duration_ms).collect();
        let retained = durations.len();
        drop(window);

        durations.sort_by(|a, b| a.total_cmp(b));

        ConnectionStats {
            total_requests: self.total.load(Ordering::Relaxed),
            open_connections: self.open_connections(),
            rate_1m: last_minute as f64 / ONE_MINUTE.as_secs_f64(),
            rate_5m: retained as f64 / WINDOW.as_secs_f64(),
            p50_ms: percentile(&durations, 0.5),
            p90_ms: percentile(&durations, 0.9),
        }
    }

    fn window(&self) -> MutexGuard<'_, VecDeque<Sample>> {
        // Samples are plain data; a panic mid-update cannot leave them torn
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Completion handle for an in-flight request
///
/// Completing is idempotent and also happens on drop, so the open count can
/// neither leak nor go negative.
#[derive(Debug)]
pub struct InFlight {
    open: Arc<AtomicUsize>,
    done: AtomicBool,
}

impl InFlight {
    pub fn complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.complete();
    }
}

fn prune(window: &mut VecDeque<Sample>, now: Instant) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(oldest.at) > WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Value at `floor(n * q)` of an ascending slice, rounded to 2 decimals
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    (sorted[index] * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let stats = StatsTracker::new().snapshot();
        assert_eq!(stats, ConnectionStats::default());
    }

    #[test]
    fn test_total_counts_every_record() {
        let tracker = StatsTracker::new();
        let start = Instant::now();
        for i in 0..25 {
            tracker.record_request_at(i as f64, start + Duration::from_secs(i * 30));
        }
        // Early samples fall out of the window, the lifetime total does not
        let stats = tracker.snapshot_at(start + Duration::from_secs(24 * 30));
        assert_eq!(stats.total_requests, 25);
    }

    #[test]
    fn test_percentiles_use_floor_index() {
        let tracker = StatsTracker::new();
        let now = Instant::now();
        for d in [50.0, 10.0, 40.0, 20.0, 30.0] {
            tracker.record_request_at(d, now);
        }

        let stats = tracker.snapshot_at(now);
        assert_eq!(stats.p50_ms, 30.0);
        assert_eq!(stats.p90_ms, 50.0);
    }

    #[test]
    fn test_percentiles_rounded_to_two_decimals() {
        let tracker = StatsTracker::new();
        let now = Instant::now();
        tracker.record_request_at(12.3456, now);

        let stats = tracker.snapshot_at(now);
        assert_eq!(stats.p50_ms, 12.35);
        assert_eq!(stats.p90_ms, 12.35);
    }

    #[test]
    fn test_rates_over_both_windows() {
        let tracker = StatsTracker::new();
        let start = Instant::now();
        // 30 requests four minutes before the snapshot, 60 in the last minute
        for _ in 0..30 {
            tracker.record_request_at(5.0, start);
        }
        let later = start + Duration::from_secs(4 * 60);
        for _ in 0..60 {
            tracker.record_request_at(5.0, later);
        }

        let stats = tracker.snapshot_at(later + Duration::from_secs(1));
        assert_eq!(stats.rate_1m, 1.0);
        assert_eq!(stats.rate_5m, 90.0 / 300.0);
    }

    #[test]
    fn test_window_prunes_after_five_minutes() {
        let tracker = StatsTracker::new();
        let start = Instant::now();
        tracker.record_request_at(100.0, start);

        let stats = tracker.snapshot_at(start + WINDOW + Duration::from_secs(1));
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.rate_5m, 0.0);
        assert_eq!(stats.p50_ms, 0.0);
    }

    #[test]
    fn test_in_flight_guard() {
        let tracker = StatsTracker::new();
        let first = tracker.mark_in_flight();
        let second = tracker.mark_in_flight();
        assert_eq!(tracker.open_connections(), 2);

        first.complete();
        first.complete();
        assert_eq!(tracker.open_connections(), 1);

        drop(second);
        assert_eq!(tracker.open_connections(), 0);

        drop(first);
        assert_eq!(tracker.open_connections(), 0);
        assert_eq!(tracker.snapshot().open_connections, 0);
    }
}
