// src/resilience/pacer.rs
//! Minimum inter-request spacing per source. This throttles successful call
//! cadence toward the upstream API; it is independent of retry backoff,
//! which only reacts to failures.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    /// Next instant a request may start. Slot reservation happens under the
    /// lock; the actual waiting happens outside it.
    next_free: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(rate_limit_rps: f32) -> Self {
        let min_interval = if rate_limit_rps > 0.0 {
            Duration::from_secs_f64(1.0 / rate_limit_rps as f64)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            next_free: Mutex::new(Instant::now()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Reserve the next slot and wait until it arrives. Concurrent callers
    /// each get their own slot, spaced `min_interval` apart.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let wait_until = {
            let mut g = self.next_free.lock().expect("pacer mutex poisoned");
            let now = Instant::now();
            let slot = if *g > now { *g } else { now };
            *g = slot + self.min_interval;
            slot
        };
        if wait_until > Instant::now() {
            tokio::time::sleep_until(wait_until).await;
        }
    }
}
