// src/resilience/retry.rs
//! Exponential backoff with jitter. The policy is pure computation; the loop
//! that applies it lives in the source client.

use std::time::Duration;

use rand::Rng;

use crate::sources::types::FetchError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Retries after the first attempt; 3 means up to 4 calls total.
    pub max_retries: u32,
    /// Backoff applied to a 429 without a Retry-After header.
    pub retry_after_default: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            retry_after_default: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the schedule: `min(base * factor^attempt, max)`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Full delay with uniform(0.5, 1.5) jitter to decorrelate retry storms.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::rng().random_range(0.5..1.5);
        self.raw_delay(attempt).mul_f64(jitter)
    }

    /// Delay before the next attempt for a given failure. A 429 with a
    /// Retry-After header overrides the computed backoff entirely.
    pub fn delay_for_error(&self, attempt: u32, err: &FetchError) -> Duration {
        if let FetchError::Http {
            status: 429,
            retry_after,
        } = err
        {
            return match retry_after {
                Some(secs) => Duration::from_secs(*secs),
                None => self.retry_after_default,
            };
        }
        self.delay_for(attempt)
    }

    pub fn should_retry(&self, attempt: u32, err: &FetchError) -> bool {
        attempt < self.max_retries && err.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_delay_is_non_decreasing_and_capped() {
        let p = RetryPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let d = p.raw_delay(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= p.max_delay);
            prev = d;
        }
        assert_eq!(p.raw_delay(19), p.max_delay);
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let p = RetryPolicy::default();
        let raw = p.raw_delay(2);
        for _ in 0..200 {
            let d = p.delay_for(2);
            assert!(d >= raw.mul_f64(0.5) && d <= raw.mul_f64(1.5), "{d:?} outside bounds");
        }
    }

    #[test]
    fn retry_after_header_overrides_backoff() {
        let p = RetryPolicy::default();
        let err = FetchError::Http {
            status: 429,
            retry_after: Some(7),
        };
        assert_eq!(p.delay_for_error(0, &err), Duration::from_secs(7));

        let bare = FetchError::Http {
            status: 429,
            retry_after: None,
        };
        assert_eq!(p.delay_for_error(0, &bare), p.retry_after_default);

        // Other transient statuses use the computed schedule.
        let e503 = FetchError::Http {
            status: 503,
            retry_after: None,
        };
        let d = p.delay_for_error(1, &e503);
        assert!(d <= p.raw_delay(1).mul_f64(1.5));
    }

    #[test]
    fn retry_budget_and_fatality_gate_retries() {
        let p = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let transient = FetchError::Timeout;
        assert!(p.should_retry(0, &transient));
        assert!(p.should_retry(1, &transient));
        assert!(!p.should_retry(2, &transient), "budget exhausted");

        let fatal = FetchError::Http {
            status: 404,
            retry_after: None,
        };
        assert!(!p.should_retry(0, &fatal));
    }
}
