//! Tracing setup and process-wide counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "bundlebox=info,tower_http=info";

/// Install the global fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    bundles_created: AtomicU64,
    parts_completed: AtomicU64,
    parts_failed: AtomicU64,
    parts_cancelled: AtomicU64,
    parts_paused: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bundle_created(&self) {
        self.bundles_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "bundles_created", "Metric incremented");
    }

    pub fn part_completed(&self) {
        self.parts_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "parts_completed", "Metric incremented");
    }

    pub fn part_failed(&self) {
        self.parts_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "parts_failed", "Metric incremented");
    }

    pub fn part_cancelled(&self) {
        self.parts_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "parts_cancelled", "Metric incremented");
    }

    pub fn part_paused(&self) {
        self.parts_paused.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "parts_paused", "Metric incremented");
    }

    // Called per chunk, so no log line
    pub fn bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bundles_created: self.bundles_created.load(Ordering::Relaxed),
            parts_completed: self.parts_completed.load(Ordering::Relaxed),
            parts_failed: self.parts_failed.load(Ordering::Relaxed),
            parts_cancelled: self.parts_cancelled.load(Ordering::Relaxed),
            parts_paused: self.parts_paused.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub bundles_created: u64,
    pub parts_completed: u64,
    pub parts_failed: u64,
    pub parts_cancelled: u64,
    pub parts_paused: u64,
    pub bytes_downloaded: u64,
}
