//! Hub statistics.
//!
//! Counters are updated by the hub worker and read from anywhere through
//! [`HubStatistics::snapshot`]:
//! - deltas handled and fragments rejected by the cache
//! - metadata deltas synthesized by the bus
//! - delta rate over the last measurement window
//! - number of paths in the snapshot

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Point-in-time copy of the hub counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub deltas_handled: u64,
    pub fragments_rejected: u64,
    pub meta_emitted: u64,
    pub delta_rate: f64,
    pub number_of_available_paths: usize,
    pub uptime: u64,
}

/// Collects hub counters.
#[derive(Debug)]
pub struct HubStatistics {
    start_time: Instant,
    deltas_handled: AtomicU64,
    window_deltas: AtomicU64,
    delta_rate: AtomicU64, // f64 bits
    fragments_rejected: AtomicU64,
    meta_emitted: AtomicU64,
    active_paths: AtomicUsize,
}

impl HubStatistics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            deltas_handled: AtomicU64::new(0),
            window_deltas: AtomicU64::new(0),
            delta_rate: AtomicU64::new(0),
            fragments_rejected: AtomicU64::new(0),
            meta_emitted: AtomicU64::new(0),
            active_paths: AtomicUsize::new(0),
        }
    }

    pub fn record_delta(&self) {
        self.deltas_handled.fetch_add(1, Ordering::Relaxed);
        self.window_deltas.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.fragments_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_meta(&self) {
        self.meta_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the measurement window (call once per second).
    pub fn update_rate(&self) {
        let window = self.window_deltas.swap(0, Ordering::Relaxed);
        self.delta_rate
            .store((window as f64).to_bits(), Ordering::Relaxed);
    }

    pub fn set_active_paths(&self, count: usize) {
        self.active_paths.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            deltas_handled: self.deltas_handled.load(Ordering::Relaxed),
            fragments_rejected: self.fragments_rejected.load(Ordering::Relaxed),
            meta_emitted: self.meta_emitted.load(Ordering::Relaxed),
            delta_rate: f64::from_bits(self.delta_rate.load(Ordering::Relaxed)),
            number_of_available_paths: self.active_paths.load(Ordering::Relaxed),
            uptime: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for HubStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_rate() {
        let stats = HubStatistics::new();
        stats.record_delta();
        stats.record_delta();
        stats.record_delta();
        stats.update_rate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.delta_rate, 3.0);
        assert_eq!(snapshot.deltas_handled, 3);

        stats.update_rate();
        assert_eq!(stats.snapshot().delta_rate, 0.0);
        assert_eq!(stats.snapshot().deltas_handled, 3);
    }

    #[test]
    fn test_counters() {
        let stats = HubStatistics::new();
        stats.record_rejected();
        stats.record_meta();
        stats.record_meta();
        stats.set_active_paths(7);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.fragments_rejected, 1);
        assert_eq!(snapshot.meta_emitted, 2);
        assert_eq!(snapshot.number_of_available_paths, 7);
    }
}
