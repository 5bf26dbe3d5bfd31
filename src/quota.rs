// src/quota.rs
//! Caller request budgets. Fixed-window counters keyed by caller identity,
//! with a hard ceiling on tracked keys: under abuse traffic with unbounded
//! caller cardinality, the oldest-seen buckets are evicted so memory stays
//! bounded. Distinct from per-source pacing, which protects upstream APIs;
//! this protects our own plan limits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Counting window; plan limits are monthly.
    pub window: Duration,
    /// Hard ceiling on tracked caller keys.
    pub max_tracked_keys: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 24 * 3600),
            max_tracked_keys: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    window_start: u64,
    count: u32,
    last_seen: u64,
}

#[derive(Debug)]
pub struct QuotaGuard {
    cfg: QuotaConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl QuotaGuard {
    pub fn new(cfg: QuotaConfig) -> Self {
        Self {
            cfg,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request against `caller`. Returns false when the caller is
    /// over `limit` for the current window.
    pub fn check_and_increment(&self, caller: &str, limit: u32) -> bool {
        self.check_and_increment_at(caller, limit, unix_now())
    }

    /// Clock-injected variant; the public wrapper passes wall time.
    fn check_and_increment_at(&self, caller: &str, limit: u32, now: u64) -> bool {
        let window_secs = self.cfg.window.as_secs();
        let mut map = self.buckets.lock().expect("quota mutex poisoned");

        let bucket = map.entry(caller.to_string()).or_insert(Bucket {
            window_start: now,
            count: 0,
            last_seen: now,
        });
        if now.saturating_sub(bucket.window_start) >= window_secs {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.last_seen = now;

        let allowed = bucket.count < limit;
        if allowed {
            bucket.count += 1;
        } else {
            counter!("quota_rejected_total").increment(1);
            debug!(target: "quota", caller, limit, "request over quota");
        }

        if map.len() > self.cfg.max_tracked_keys {
            evict_oldest(&mut map, self.cfg.max_tracked_keys);
        }
        allowed
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().expect("quota mutex poisoned").len()
    }
}

/// Drop the oldest-seen buckets until the map fits the ceiling.
fn evict_oldest(map: &mut HashMap<String, Bucket>, ceiling: usize) {
    let excess = map.len().saturating_sub(ceiling);
    if excess == 0 {
        return;
    }
    let mut by_age: Vec<(u64, String)> = map
        .iter()
        .map(|(k, b)| (b.last_seen, k.clone()))
        .collect();
    by_age.sort_unstable();
    for (_, key) in by_age.into_iter().take(excess) {
        map.remove(&key);
    }
    counter!("quota_evictions_total").increment(excess as u64);
}

fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(max_tracked: usize, window_secs: u64) -> QuotaGuard {
        QuotaGuard::new(QuotaConfig {
            window: Duration::from_secs(window_secs),
            max_tracked_keys: max_tracked,
        })
    }

    #[test]
    fn enforces_limit_within_window() {
        let g = guard(100, 3600);
        assert!(g.check_and_increment_at("alice", 2, 1000));
        assert!(g.check_and_increment_at("alice", 2, 1001));
        assert!(!g.check_and_increment_at("alice", 2, 1002));
        // Other callers are unaffected.
        assert!(g.check_and_increment_at("bob", 2, 1002));
    }

    #[test]
    fn window_expiry_resets_count() {
        let g = guard(100, 60);
        assert!(g.check_and_increment_at("alice", 1, 1000));
        assert!(!g.check_and_increment_at("alice", 1, 1030));
        // Window rolls at 1060.
        assert!(g.check_and_increment_at("alice", 1, 1061));
    }

    #[test]
    fn tracked_keys_never_exceed_ceiling() {
        let g = guard(50, 3600);
        for i in 0..500 {
            g.check_and_increment_at(&format!("caller-{i}"), 10, 1000 + i);
        }
        assert!(g.tracked_keys() <= 50, "got {}", g.tracked_keys());
    }

    #[test]
    fn eviction_drops_oldest_seen_first() {
        let g = guard(2, 3600);
        g.check_and_increment_at("old", 10, 100);
        g.check_and_increment_at("mid", 10, 200);
        g.check_and_increment_at("new", 10, 300);
        let map = g.buckets.lock().unwrap();
        assert!(!map.contains_key("old"));
        assert!(map.contains_key("mid") && map.contains_key("new"));
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let g = guard(10, 3600);
        assert!(!g.check_and_increment_at("alice", 0, 1000));
    }
}
