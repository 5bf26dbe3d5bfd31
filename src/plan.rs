// src/plan.rs
//! Plan capability lookup. The auth/plan service is an external collaborator;
//! we cache its answers per caller with a TTL and fall back to hard-coded
//! defaults when it is unreachable. The fallback is tagged, not silent, so
//! callers and tests can see degraded mode.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

/// Capabilities granted by a caller's subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub max_requests_per_window: u32,
    /// How far back `date_from` may reach.
    pub max_history_days: u32,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_requests_per_window: 100,
            max_history_days: 90,
        }
    }
}

/// Where the limits came from: the store, or the built-in default after a
/// load failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    FromStore,
    FromFallback,
}

impl PlanOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanOrigin::FromStore => "store",
            PlanOrigin::FromFallback => "fallback",
        }
    }
}

#[async_trait::async_trait]
pub trait PlanProvider: Send + Sync {
    async fn load(&self, caller: &str) -> anyhow::Result<PlanLimits>;
}

/// Provider with fixed limits for every caller. Default wiring until a real
/// plan service is attached, and the workhorse in tests.
pub struct StaticPlans(pub PlanLimits);

#[async_trait::async_trait]
impl PlanProvider for StaticPlans {
    async fn load(&self, _caller: &str) -> anyhow::Result<PlanLimits> {
        Ok(self.0)
    }
}

struct CachedLimits {
    limits: PlanLimits,
    origin: PlanOrigin,
    loaded_at: Instant,
}

/// TTL cache over a `PlanProvider`. Failures cache the fallback too, so a
/// dead plan service is not hammered on every request.
pub struct CachedPlans {
    provider: Box<dyn PlanProvider>,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedLimits>>,
}

impl CachedPlans {
    pub fn new(provider: Box<dyn PlanProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn limits_for(&self, caller: &str) -> (PlanLimits, PlanOrigin) {
        {
            let cache = self.cache.lock().expect("plan cache poisoned");
            if let Some(entry) = cache.get(caller) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return (entry.limits, entry.origin);
                }
            }
        }

        // Lock released across the load; a racing caller may load twice,
        // which is harmless.
        let (limits, origin) = match self.provider.load(caller).await {
            Ok(limits) => (limits, PlanOrigin::FromStore),
            Err(e) => {
                warn!(target: "plan", caller, error = %e, "plan lookup failed; using fallback limits");
                (PlanLimits::default(), PlanOrigin::FromFallback)
            }
        };

        let mut cache = self.cache.lock().expect("plan cache poisoned");
        cache.insert(
            caller.to_string(),
            CachedLimits {
                limits,
                origin,
                loaded_at: Instant::now(),
            },
        );
        (limits, origin)
    }
}
