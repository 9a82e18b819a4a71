//! Global bandwidth budget shared by every active transfer
//!
//! A single token bucket holds bytes that may be sent. The bucket starts
//! empty, refills continuously at the budget rate and holds at most one
//! second of budget.
//!
//! # Fairness
//!
//! The bucket sits behind a `tokio::sync::Mutex`, whose waiters are served
//! in the order they queued. A caller takes its bytes immediately, running
//! the bucket into debt if needed, and then sleeps off that debt while still
//! holding the lock. Later callers therefore wait behind it in request order
//! and nobody can overtake a large request with a stream of small ones.
//!
//! Under saturation the bytes granted in any window of length `t` never
//! exceed `rate * t` plus whatever was accrued before the window began
//! (at most one second of budget after an idle period).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("Rate budget must be positive")]
    ZeroBudget,
}

#[derive(Debug)]
struct Bucket {
    /// Negative while a caller is paying off debt
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared across all workers of the process
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with the given aggregate budget in bytes per second
    ///
    /// # Errors
    ///
    /// A zero budget can never be satisfied and is refused.
    pub fn new(bytes_per_sec: u64) -> Result<Self, LimiterError> {
        if bytes_per_sec == 0 {
            return Err(LimiterError::ZeroBudget);
        }

        Ok(Self {
            bytes_per_sec,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            })),
        })
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    fn capacity(&self) -> f64 {
        self.bytes_per_sec as f64
    }

    /// Suspend until `bytes` fit within the budget
    ///
    /// Dropping the future while it sleeps keeps the bytes charged. Callers
    /// that abandon an acquisition have already received the data.
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let mut bucket = self.bucket.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.bytes_per_sec as f64).min(self.capacity());
        bucket.last_refill = now;

        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            return;
        }

        let debt = -bucket.tokens;
        let wait = Duration::from_secs_f64(debt / self.bytes_per_sec as f64);
        trace!(bytes, wait_ms = wait.as_millis() as u64, "Waiting for bandwidth");

        tokio::time::sleep(wait).await;

        // The sleep refilled exactly the debt
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
    }
}
