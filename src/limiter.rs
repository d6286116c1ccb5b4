//! Global request pacing.
//!
//! One [`RateLimiter`] guards the whole account: every network call the
//! dispatcher makes, retries included, first passes through
//! [`RateLimiter::wait`]. Waiters queue on a fair async mutex, so
//! concurrent callers are released one at a time, each at least
//! `min_interval` after the previous one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;

/// Enforces a minimum wall-clock gap between consecutive outbound calls.
///
/// The limiter never fails. A caller with its own deadline can wrap
/// [`wait`](Self::wait) in `tokio::time::timeout` and abandon it; the
/// abandoned waiter does not consume a slot.
pub struct RateLimiter {
    min_interval: Duration,
    last_release: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_release: Mutex::new(None),
        }
    }

    /// Construct a limiter that remembers a call made before this process
    /// started (typically the usage ledger's newest record), so a quick
    /// restart cannot burst past the pacing interval.
    pub fn seeded(min_interval: Duration, last_call: Option<DateTime<Utc>>) -> Self {
        let last_release = last_call.and_then(|at| {
            let elapsed = Utc::now().signed_duration_since(at).to_std().unwrap_or_default();
            if elapsed >= min_interval {
                return None;
            }
            Instant::now().checked_sub(elapsed)
        });
        Self {
            min_interval,
            last_release: Mutex::new(last_release),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Block until at least `min_interval` has passed since the previous
    /// `wait()` returned.
    pub async fn wait(&self) {
        let started = Instant::now();
        let mut last = self.last_release.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                debug!(
                    delay_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "pacing outbound request"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        metrics::histogram!(telemetry::RATE_LIMIT_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
    }
}
