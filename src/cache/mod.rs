// src/cache/mod.rs
//! # Two-tier result cache with stale-while-revalidate
//!
//! Tier 1 is an in-process map with a short fresh TTL; tier 2 is the durable
//! store (24h), consulted on in-process miss. A stale entry is served
//! immediately while one background refresh runs: the `is_revalidating`
//! flag is flipped compare-and-set style under the map lock, so concurrent
//! callers for the same key never trigger duplicate upstream fetches, and a
//! global semaphore caps refresh concurrency system-wide.
//!
//! Entries are tiered by access frequency: hot keys get a shorter fresh TTL
//! (staleness matters more), cold keys a longer one (amortize the fetch).

pub mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::warn;

use crate::cache::store::{now_unix, DurableStore, StoredEntry};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Baseline fresh TTL for the in-process tier (Warm).
    pub memory_fresh_ttl: Duration,
    /// Entries older than this in the durable tier are ignored entirely.
    pub durable_ttl: Duration,
    /// Global cap on concurrent background revalidations.
    pub max_concurrent_revalidations: usize,
    /// Accesses within the window at which a key counts as hot.
    pub hot_threshold: u32,
    pub access_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_fresh_ttl: Duration::from_secs(4 * 3600),
            durable_ttl: Duration::from_secs(24 * 3600),
            max_concurrent_revalidations: 4,
            hot_threshold: 8,
            access_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Hot,
    Warm,
    Cold,
}

impl CacheTier {
    fn ttl_multiplier(&self) -> f64 {
        match self {
            CacheTier::Hot => 0.5,
            CacheTier::Warm => 1.0,
            CacheTier::Cold => 2.0,
        }
    }
}

/// How the returned value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Miss => "MISS",
        }
    }
}

#[derive(Debug)]
struct MemoryEntry<T> {
    value: T,
    stored_at: Instant,
    tier: CacheTier,
    is_revalidating: bool,
    hits: u32,
    window_start: Instant,
}

/// Counts for the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub revalidating: usize,
}

enum MemoryLookup<T> {
    Fresh(T),
    /// Second field: this caller won the revalidation CAS.
    Stale(T, bool),
    Miss,
}

struct CacheInner<T> {
    memory: RwLock<HashMap<String, MemoryEntry<T>>>,
    durable: Arc<dyn DurableStore>,
    cfg: CacheConfig,
    revalidations: Arc<Semaphore>,
}

/// Cheap-to-clone handle; clones share the same tiers and refresh budget,
/// which lets background tasks own a handle without lifetime gymnastics.
pub struct CacheLayer<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for CacheLayer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> CacheLayer<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(durable: Arc<dyn DurableStore>, cfg: CacheConfig) -> Self {
        let permits = cfg.max_concurrent_revalidations.max(1);
        Self {
            inner: Arc::new(CacheInner {
                memory: RwLock::new(HashMap::new()),
                durable,
                cfg,
                revalidations: Arc::new(Semaphore::new(permits)),
            }),
        }
    }

    pub fn fresh_ttl(&self, tier: CacheTier) -> Duration {
        self.inner.cfg.memory_fresh_ttl.mul_f64(tier.ttl_multiplier())
    }

    /// Serve from cache or compute. Stale values return immediately with a
    /// background refresh; a cold miss computes inline. Compute errors only
    /// surface on the inline path; background failures are logged.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<(T, CacheStatus), E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        match self.memory_lookup(key) {
            MemoryLookup::Fresh(value) => {
                counter!("cache_hits_total", "tier" => "memory").increment(1);
                return Ok((value, CacheStatus::Hit));
            }
            MemoryLookup::Stale(value, won_cas) => {
                counter!("cache_stale_total").increment(1);
                if won_cas {
                    self.spawn_refresh_or_release(key, compute);
                }
                return Ok((value, CacheStatus::Stale));
            }
            MemoryLookup::Miss => {}
        }

        // In-process miss: consult the durable tier. Store errors degrade to
        // a plain miss; they never fail the request.
        match self.inner.durable.get(key).await {
            Ok(Some(entry)) => {
                let age = entry.age_secs(now_unix());
                if age <= self.inner.cfg.durable_ttl.as_secs() {
                    match serde_json::from_value::<T>(entry.payload) {
                        Ok(value) => {
                            let is_fresh = age < self.fresh_ttl(CacheTier::Warm).as_secs();
                            self.promote(key, value.clone(), age);
                            if is_fresh {
                                counter!("cache_hits_total", "tier" => "durable").increment(1);
                                return Ok((value, CacheStatus::Hit));
                            }
                            counter!("cache_stale_total").increment(1);
                            if self.try_mark_revalidating(key) {
                                self.spawn_refresh_or_release(key, compute);
                            }
                            return Ok((value, CacheStatus::Stale));
                        }
                        Err(e) => {
                            warn!(target: "cache", key, error = %e, "durable entry undecodable; recomputing");
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: "cache", key, error = %e, "durable store lookup failed; treating as miss");
            }
        }

        let value = compute().await?;
        counter!("cache_misses_total").increment(1);
        self.install(key, &value).await;
        Ok((value, CacheStatus::Miss))
    }

    /// Drop an entry from both tiers (administrative invalidation).
    pub async fn invalidate(&self, key: &str) {
        if let Ok(mut map) = self.inner.memory.write() {
            map.remove(key);
        }
        if let Err(e) = self.inner.durable.delete(key).await {
            warn!(target: "cache", key, error = %e, "durable delete failed");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let map = self.inner.memory.read().expect("cache lock poisoned");
        let mut stats = CacheStats {
            entries: map.len(),
            hot: 0,
            warm: 0,
            cold: 0,
            revalidating: 0,
        };
        for e in map.values() {
            match e.tier {
                CacheTier::Hot => stats.hot += 1,
                CacheTier::Warm => stats.warm += 1,
                CacheTier::Cold => stats.cold += 1,
            }
            if e.is_revalidating {
                stats.revalidating += 1;
            }
        }
        stats
    }

    /* ---- internals ---- */

    fn tier_for(&self, hits: u32) -> CacheTier {
        if hits >= self.inner.cfg.hot_threshold {
            CacheTier::Hot
        } else if hits <= 1 {
            CacheTier::Cold
        } else {
            CacheTier::Warm
        }
    }

    /// One pass under the write lock: access accounting, tier refresh,
    /// freshness check, and the revalidation CAS for stale entries.
    fn memory_lookup(&self, key: &str) -> MemoryLookup<T> {
        let mut map = self.inner.memory.write().expect("cache lock poisoned");
        let Some(e) = map.get_mut(key) else {
            return MemoryLookup::Miss;
        };
        let now = Instant::now();
        if now.duration_since(e.window_start) > self.inner.cfg.access_window {
            e.window_start = now;
            e.hits = 0;
        }
        e.hits = e.hits.saturating_add(1);
        e.tier = self.tier_for(e.hits);

        let ttl = self.inner.cfg.memory_fresh_ttl.mul_f64(e.tier.ttl_multiplier());
        if now.duration_since(e.stored_at) < ttl {
            return MemoryLookup::Fresh(e.value.clone());
        }
        let won = if e.is_revalidating {
            false
        } else {
            e.is_revalidating = true;
            true
        };
        MemoryLookup::Stale(e.value.clone(), won)
    }

    /// CAS the flag on an existing entry; true when this caller set it.
    fn try_mark_revalidating(&self, key: &str) -> bool {
        let mut map = self.inner.memory.write().expect("cache lock poisoned");
        match map.get_mut(key) {
            Some(e) if !e.is_revalidating => {
                e.is_revalidating = true;
                true
            }
            _ => false,
        }
    }

    fn clear_revalidating(&self, key: &str) {
        if let Ok(mut map) = self.inner.memory.write() {
            if let Some(e) = map.get_mut(key) {
                e.is_revalidating = false;
            }
        }
    }

    /// Holder of the CAS win: spawn the refresh if a global permit is free,
    /// otherwise release the flag so a later caller can try again.
    fn spawn_refresh_or_release<F, Fut, E>(&self, key: &str, compute: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        match self.inner.revalidations.clone().try_acquire_owned() {
            Ok(permit) => self.spawn_refresh(key.to_string(), compute, permit),
            Err(_) => {
                counter!("cache_revalidations_skipped_total").increment(1);
                self.clear_revalidating(key);
            }
        }
    }

    fn spawn_refresh<F, Fut, E>(&self, key: String, compute: F, permit: OwnedSemaphorePermit)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            counter!("cache_revalidations_total").increment(1);
            match compute().await {
                Ok(value) => {
                    this.install(&key, &value).await;
                }
                Err(e) => {
                    warn!(target: "cache", key = %key, error = %e, "background revalidation failed");
                }
            }
            this.clear_revalidating(&key);
            drop(permit);
        });
    }

    /// Write a freshly computed value to both tiers.
    async fn install(&self, key: &str, value: &T) {
        {
            let mut map = self.inner.memory.write().expect("cache lock poisoned");
            let now = Instant::now();
            let entry = map.entry(key.to_string()).or_insert_with(|| MemoryEntry {
                value: value.clone(),
                stored_at: now,
                tier: CacheTier::Cold,
                is_revalidating: false,
                hits: 0,
                window_start: now,
            });
            entry.value = value.clone();
            entry.stored_at = now;
            entry.is_revalidating = false;
        }
        match serde_json::to_value(value) {
            Ok(payload) => {
                let stored = StoredEntry {
                    payload,
                    stored_at_unix: now_unix(),
                };
                if let Err(e) = self.inner.durable.put(key, &stored).await {
                    warn!(target: "cache", key, error = %e, "durable store write failed");
                }
            }
            Err(e) => warn!(target: "cache", key, error = %e, "payload not serializable"),
        }
    }

    /// Pull a durable entry into the in-process tier, backdating `stored_at`
    /// so its remaining freshness carries over.
    fn promote(&self, key: &str, value: T, age_secs: u64) {
        let mut map = self.inner.memory.write().expect("cache lock poisoned");
        let now = Instant::now();
        let stored_at = now
            .checked_sub(Duration::from_secs(age_secs))
            .unwrap_or(now);
        map.insert(
            key.to_string(),
            MemoryEntry {
                value,
                stored_at,
                tier: CacheTier::Cold,
                is_revalidating: false,
                hits: 1,
                window_start: now,
            },
        );
    }
}
