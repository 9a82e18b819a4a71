//! Pacing of progress samples emitted by a single transfer

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Time-based throttle: at most one sample per interval, plus forced ones
#[derive(Debug, Clone)]
pub struct SampleCadence {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl SampleCadence {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns true and records the emission when the interval has passed
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// For the final sample of a transfer
    pub fn force_emit(&mut self, now: Instant) {
        self.last_emit = Some(now);
    }
}

const SPEED_WINDOW: Duration = Duration::from_secs(2);

/// Transfer speed over a sliding window
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: Duration,
    points: VecDeque<(Instant, u64)>,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(SPEED_WINDOW)
    }
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            points: VecDeque::new(),
        }
    }

    /// Record the cumulative byte count at `now`
    pub fn record(&mut self, now: Instant, transferred: u64) {
        self.points.push_back((now, transferred));
        while let Some(&(at, _)) = self.points.front() {
            if now.duration_since(at) > self.window && self.points.len() > 2 {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second between the oldest and newest recorded points
    pub fn bytes_per_sec(&self) -> u64 {
        let (Some(&(first_at, first)), Some(&(last_at, last))) =
            (self.points.front(), self.points.back())
        else {
            return 0;
        };

        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (last.saturating_sub(first) as f64 / elapsed) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cadence_throttles() {
        let mut cadence = SampleCadence::new(Duration::from_millis(100));
        let start = Instant::now();

        assert!(cadence.should_emit(start));
        assert!(!cadence.should_emit(start + Duration::from_millis(50)));
        assert!(cadence.should_emit(start + Duration::from_millis(100)));

        cadence.force_emit(start + Duration::from_millis(120));
        assert!(!cadence.should_emit(start + Duration::from_millis(150)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_over_window() {
        let mut meter = SpeedMeter::new(Duration::from_secs(2));
        let start = Instant::now();
        assert_eq!(meter.bytes_per_sec(), 0);

        meter.record(start, 0);
        meter.record(start + Duration::from_secs(1), 1000);
        assert_eq!(meter.bytes_per_sec(), 1000);

        // Old points fall out of the window
        meter.record(start + Duration::from_secs(5), 1000);
        meter.record(start + Duration::from_secs(6), 5000);
        assert_eq!(meter.bytes_per_sec(), 4000);
    }
}
