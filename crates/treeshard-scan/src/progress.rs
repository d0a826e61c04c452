//! Walk progress reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

/// Directories between two published snapshots.
const PUBLISH_EVERY: u64 = 1024;

/// Progress information during a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalkProgress {
    /// Directories accepted by Phase 1 so far.
    pub dirs_discovered: u64,
    /// Files listed so far (either phase).
    pub files_listed: u64,
    /// Units handed to the assigner so far.
    pub units_assigned: u64,
    /// Recoverable errors so far.
    pub errors: u64,
    /// Time elapsed since the run started.
    pub elapsed: Duration,
}

impl WalkProgress {
    /// Calculate the listing rate in files per second.
    pub fn files_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.files_listed as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// Shared counters updated by every worker, with a broadcast channel for
/// periodic snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    start_time: Instant,
    dirs_discovered: AtomicU64,
    files_listed: AtomicU64,
    units_assigned: AtomicU64,
    errors: AtomicU64,
    tx: broadcast::Sender<WalkProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_sender(Self::channel())
    }

    /// A fresh channel for [`with_sender`](Self::with_sender). Subscribers
    /// stay attached across trackers sharing it.
    pub fn channel() -> broadcast::Sender<WalkProgress> {
        broadcast::channel(100).0
    }

    /// A tracker with zeroed counters that publishes on `tx`.
    pub fn with_sender(tx: broadcast::Sender<WalkProgress>) -> Self {
        Self {
            start_time: Instant::now(),
            dirs_discovered: AtomicU64::new(0),
            files_listed: AtomicU64::new(0),
            units_assigned: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            tx,
        }
    }

    /// Subscribe to progress snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<WalkProgress> {
        self.tx.subscribe()
    }

    pub fn record_dir(&self) {
        let count = self.dirs_discovered.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PUBLISH_EVERY == 0 {
            self.publish();
        }
    }

    pub fn record_files(&self, count: u64) {
        self.files_listed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_unit(&self) {
        self.units_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_errors(&self, count: u64) {
        self.errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WalkProgress {
        WalkProgress {
            dirs_discovered: self.dirs_discovered.load(Ordering::Relaxed),
            files_listed: self.files_listed.load(Ordering::Relaxed),
            units_assigned: self.units_assigned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed: self.start_time.elapsed(),
        }
    }

    /// Send a snapshot to subscribers. Having none is fine.
    pub fn publish(&self) {
        let _ = self.tx.send(self.snapshot());
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
