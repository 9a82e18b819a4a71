use serde::Serialize;
use std::sync::OnceLock;
use tokio::time::Instant;

use crate::queue::JobId;

/// Milliseconds since the first call in this process
///
/// Sample timestamps only order samples of one process and are never
/// compared with wall-clock time.
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// One progress observation of a running part. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub job_id: JobId,
    pub transferred: u64,
    /// Total size in bytes, 0 when the source did not announce it
    pub length: u64,
    /// Bytes per second
    pub speed: u64,
    pub timestamp_ms: u64,
}

impl ProgressSample {
    /// Share of the part transferred, in percent. 0 when the length is unknown.
    pub fn percentage(&self) -> f64 {
        percentage(self.transferred, self.length)
    }

    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.transferred)
    }

    /// Seconds left at the current speed; `None` means unbounded
    pub fn eta_secs(&self) -> Option<u64> {
        eta_secs(self.remaining(), self.speed)
    }

    pub fn report(&self) -> SampleReport {
        SampleReport {
            job_id: self.job_id,
            transferred: self.transferred,
            length: self.length,
            speed: self.speed,
            timestamp_ms: self.timestamp_ms,
            percentage: self.percentage(),
            remaining: self.remaining(),
            eta_secs: self.eta_secs(),
        }
    }
}

/// Wire form of a sample, derived fields included
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleReport {
    pub job_id: JobId,
    pub transferred: u64,
    pub length: u64,
    pub speed: u64,
    pub timestamp_ms: u64,
    pub percentage: f64,
    pub remaining: u64,
    pub eta_secs: Option<u64>,
}

/// Aggregate of the latest samples of every part in a bundle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleProgress {
    pub bundle_id: JobId,
    pub length: u64,
    pub transferred: u64,
    pub speed: u64,
    pub percentage: f64,
    pub eta_secs: Option<u64>,
    /// Parts in the bundle
    pub parts: usize,
    /// Parts that reported at least one sample
    pub reporting: usize,
}

impl BundleProgress {
    /// Sum the given samples; recomputed from scratch on every call
    pub fn compute<'a>(
        bundle_id: JobId,
        parts: usize,
        samples: impl IntoIterator<Item = &'a ProgressSample>,
    ) -> Self {
        let mut length = 0u64;
        let mut transferred = 0u64;
        let mut speed = 0u64;
        let mut reporting = 0usize;

        for sample in samples {
            length = length.saturating_add(sample.length);
            transferred = transferred.saturating_add(sample.transferred);
            speed = speed.saturating_add(sample.speed);
            reporting += 1;
        }

        Self {
            bundle_id,
            length,
            transferred,
            speed,
            percentage: percentage(transferred, length),
            eta_secs: eta_secs(length.saturating_sub(transferred), speed),
            parts,
            reporting,
        }
    }
}

fn percentage(transferred: u64, length: u64) -> f64 {
    if length == 0 {
        return 0.0;
    }
    transferred as f64 / length as f64 * 100.0
}

fn eta_secs(remaining: u64, speed: u64) -> Option<u64> {
    if speed == 0 {
        return None;
    }
    Some(remaining.div_ceil(speed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(job: u64, transferred: u64, length: u64, speed: u64) -> ProgressSample {
        ProgressSample {
            job_id: JobId(job),
            transferred,
            length,
            speed,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_derived_fields() {
        let s = sample(1, 250, 1000, 50);
        assert_eq!(s.percentage(), 25.0);
        assert_eq!(s.remaining(), 750);
        assert_eq!(s.eta_secs(), Some(15));
    }

    #[test]
    fn test_unknown_length_and_stalled_speed() {
        let s = sample(1, 250, 0, 0);
        assert_eq!(s.percentage(), 0.0);
        assert_eq!(s.remaining(), 0);
        assert_eq!(s.eta_secs(), None);
    }

    #[test]
    fn test_bundle_sums_parts() {
        let samples = [sample(1, 100, 400, 10), sample(2, 300, 600, 30)];
        let progress = BundleProgress::compute(JobId(0), 3, &samples);

        assert_eq!(progress.length, 1000);
        assert_eq!(progress.transferred, 400);
        assert_eq!(progress.speed, 40);
        assert_eq!(progress.percentage, 40.0);
        assert_eq!(progress.eta_secs, Some(15));
        assert_eq!(progress.parts, 3);
        assert_eq!(progress.reporting, 2);
    }

    #[test]
    fn test_report_serializes_derived_fields() {
        let value = serde_json::to_value(sample(4, 50, 100, 0).report()).unwrap();
        assert_eq!(value["job_id"], 4);
        assert_eq!(value["percentage"], 50.0);
        assert_eq!(value["remaining"], 50);
        assert!(value["eta_secs"].is_null());
    }
}
