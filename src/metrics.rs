//! Run metrics.
//!
//! Atomic counters shared by the analyzer workers and the writer, plus a
//! Prometheus text rendering for scraping by an external agent.
//!
//! # Metrics Exported
//!
//! - `beacon_hunt_pairs_analyzed` - Pairs that produced an update
//! - `beacon_hunt_beacons` - Pairs classified as beacons
//! - `beacon_hunt_plain_connections` - Pairs classified as plain connections
//! - `beacon_hunt_insufficient_data` - Plain connections with too little data to score
//! - `beacon_hunt_worker_faults` - Pairs skipped because analysis faulted
//! - `beacon_hunt_updates_applied` - Updates applied by the writer
//! - `beacon_hunt_write_failures` - Store operations that failed
//! - `beacon_hunt_failed_pairs` - Pairs with at least one failed store operation
//! - `beacon_hunt_max_in_flight` - Peak number of updates between workers and store

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Atomic metrics counters for thread-safe updates.
#[derive(Debug, Default)]
pub struct RunMetrics {
    pairs_analyzed: AtomicU64,
    beacons: AtomicU64,
    plain_connections: AtomicU64,
    insufficient_data: AtomicU64,
    worker_faults: AtomicU64,
    updates_applied: AtomicU64,
    write_failures: AtomicU64,
    failed_pairs: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_beacon(&self) {
        self.pairs_analyzed.fetch_add(1, Ordering::Relaxed);
        self.beacons.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_plain(&self, insufficient: bool) {
        self.pairs_analyzed.fetch_add(1, Ordering::Relaxed);
        self.plain_connections.fetch_add(1, Ordering::Relaxed);
        if insufficient {
            self.insufficient_data.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_worker_fault(&self) {
        self.worker_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by the writer once per update that had any failed operation.
    pub fn inc_failed_pair(&self) {
        self.failed_pairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by a worker right before it publishes an update.
    pub fn update_enqueued(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    /// Called by a worker whose publish failed because the writer is gone.
    pub fn update_dropped(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Called by the writer once an update's effects are complete.
    pub fn update_applied(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> RunStats {
        RunStats {
            pairs_analyzed: self.pairs_analyzed.load(Ordering::Relaxed),
            beacons: self.beacons.load(Ordering::Relaxed),
            plain_connections: self.plain_connections.load(Ordering::Relaxed),
            insufficient_data: self.insufficient_data.load(Ordering::Relaxed),
            worker_faults: self.worker_faults.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            failed_pairs: self.failed_pairs.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Shared metrics handle for use across tasks.
pub type SharedRunMetrics = Arc<RunMetrics>;

/// Create a new shared metrics instance.
pub fn new_shared_metrics() -> SharedRunMetrics {
    Arc::new(RunMetrics::new())
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub pairs_analyzed: u64,
    pub beacons: u64,
    pub plain_connections: u64,
    pub insufficient_data: u64,
    pub worker_faults: u64,
    pub updates_applied: u64,
    /// Store operations that failed.
    pub write_failures: u64,
    /// Pairs whose update had at least one failed store operation.
    pub failed_pairs: u64,
    pub max_in_flight: u64,
}

impl RunStats {
    /// Pairs that did not make it through cleanly: skipped by a worker, or
    /// only partly written.
    pub fn failed(&self) -> u64 {
        self.worker_faults + self.failed_pairs
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_format(&self) -> String {
        let metrics: [(&str, &str, &str, u64); 9] = [
            ("pairs_analyzed", "Pairs that produced an update", "counter", self.pairs_analyzed),
            ("beacons", "Pairs classified as beacons", "counter", self.beacons),
            (
                "plain_connections",
                "Pairs classified as plain connections",
                "counter",
                self.plain_connections,
            ),
            (
                "insufficient_data",
                "Plain connections with too little data to score",
                "counter",
                self.insufficient_data,
            ),
            ("worker_faults", "Pairs skipped because analysis faulted", "counter", self.worker_faults),
            ("updates_applied", "Updates applied by the writer", "counter", self.updates_applied),
            ("write_failures", "Store operations that failed", "counter", self.write_failures),
            (
                "failed_pairs",
                "Pairs with at least one failed store operation",
                "counter",
                self.failed_pairs,
            ),
            (
                "max_in_flight",
                "Peak number of updates between workers and store",
                "gauge",
                self.max_in_flight,
            ),
        ];

        let mut output = String::new();
        for (name, help, kind, value) in metrics {
            output.push_str(&format!("# HELP beacon_hunt_{} {}\n", name, help));
            output.push_str(&format!("# TYPE beacon_hunt_{} {}\n", name, kind));
            output.push_str(&format!("beacon_hunt_{} {}\n\n", name, value));
        }
        output
    }
}
