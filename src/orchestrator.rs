// src/orchestrator.rs
//! # Search orchestrator
//!
//! Sole entry point for consolidated searches. Consults the cache, fans out
//! to every enabled source in parallel (each bounded by its own timeout and
//! all of them by a global deadline), classifies records per source, then
//! consolidates across sources. Sources that fail are recorded with a reason
//! and never abort the search; only zero successes do.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cache::{CacheLayer, CacheStatus};
use crate::classify::ClassificationFilter;
use crate::client::{ClientError, ResilientSourceClient, DEFAULT_PAGE_CEILING};
use crate::consolidate::consolidate;
use crate::model::{SearchRequest, SearchResult, SourceFailure, SourceName, UnifiedRecord};
use crate::resilience::{BreakerRegistry, RetryPolicy};
use crate::sources::providers::build_provider;
use crate::sources::types::{SourceProvider, SourceQuery};
use crate::sources::RegistryHandle;

pub const ENV_SEARCH_DEADLINE_SECS: &str = "SEARCH_DEADLINE_SECS";

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Bounds the whole fan-out; per-source timeouts are shorter.
    pub global_deadline: Duration,
    pub page_size: u32,
    pub page_ceiling: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            global_deadline: Duration::from_secs(45),
            page_size: 50,
            page_ceiling: DEFAULT_PAGE_CEILING,
        }
    }
}

impl SearchOptions {
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(secs) = std::env::var(ENV_SEARCH_DEADLINE_SECS)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            opts.global_deadline = Duration::from_secs(secs.max(1));
        }
        opts
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("all sources unavailable")]
    AllSourcesUnavailable { failures: Vec<SourceFailure> },
}

#[derive(Clone)]
pub struct SearchOrchestrator {
    registry: RegistryHandle,
    breakers: BreakerRegistry,
    filter: Arc<ClassificationFilter>,
    cache: CacheLayer<SearchResult>,
    policy: RetryPolicy,
    options: SearchOptions,
    /// Test/bench injection: providers used instead of the built ones.
    overrides: HashMap<SourceName, Arc<dyn SourceProvider>>,
}

impl SearchOrchestrator {
    pub fn new(
        registry: RegistryHandle,
        breakers: BreakerRegistry,
        filter: Arc<ClassificationFilter>,
        cache: CacheLayer<SearchResult>,
        policy: RetryPolicy,
        options: SearchOptions,
    ) -> Self {
        Self {
            registry,
            breakers,
            filter,
            cache,
            policy,
            options,
            overrides: HashMap::new(),
        }
    }

    /// Replace the provider for one source; the resilience wrapping stays.
    pub fn with_provider(mut self, source: SourceName, provider: Arc<dyn SourceProvider>) -> Self {
        self.overrides.insert(source, provider);
        self
    }

    pub fn cache(&self) -> &CacheLayer<SearchResult> {
        &self.cache
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Cached search. `CacheStatus` tells the API layer how the result was
    /// obtained (fresh hit, stale-while-revalidating, or computed).
    pub async fn search(
        &self,
        request: SearchRequest,
    ) -> Result<(SearchResult, CacheStatus), SearchError> {
        self.validate(&request)?;
        let key = format!("search:{}", request.fingerprint());
        let this = self.clone();
        self.cache
            .get_or_compute(&key, move || {
                let orchestrator = this.clone();
                let request = request.clone();
                async move { orchestrator.fan_out(request).await }
            })
            .await
    }

    fn validate(&self, request: &SearchRequest) -> Result<(), SearchError> {
        if request.date_from > request.date_to {
            return Err(SearchError::InvalidRequest(
                "date_from is after date_to".into(),
            ));
        }
        for uf in &request.states {
            let uf = uf.trim();
            if uf.len() != 2 || !uf.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(SearchError::InvalidRequest(format!(
                    "invalid state code `{uf}`"
                )));
            }
        }
        Ok(())
    }

    /// The uncached fan-out. One task per enabled source; per-record
    /// classification runs inside each task so slow sources do not serialize
    /// behind fast ones.
    async fn fan_out(&self, request: SearchRequest) -> Result<SearchResult, SearchError> {
        let started = std::time::Instant::now();
        counter!("search_requests_total").increment(1);

        let registry = self.registry.snapshot();
        let priorities = registry.priorities();
        let query = SourceQuery {
            date_from: request.date_from,
            date_to: request.date_to,
            states: request
                .states
                .iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .collect(),
            page_size: self.options.page_size,
        };
        let matcher = self.filter.matcher_for(request.keywords.as_deref());
        let page_ceiling = request
            .max_pages
            .unwrap_or(self.options.page_ceiling)
            .clamp(1, self.options.page_ceiling);

        let mut failures: Vec<SourceFailure> = Vec::new();
        let mut attempted = 0usize;
        let mut pending: HashSet<SourceName> = HashSet::new();
        let mut join: JoinSet<(SourceName, Result<(usize, Vec<UnifiedRecord>), String>)> =
            JoinSet::new();

        for cfg in registry.enabled().into_iter().cloned() {
            attempted += 1;
            let source = cfg.code;
            let provider = match self.overrides.get(&source) {
                Some(p) => p.clone(),
                None => match build_provider(&cfg) {
                    Some(p) => p,
                    None => {
                        warn!(target: "search", source = %source, "credentials missing; skipping source");
                        failures.push(SourceFailure {
                            source,
                            reason: "credentials missing".into(),
                        });
                        continue;
                    }
                },
            };
            let breaker = match self.breakers.get(source) {
                Some(b) => b,
                None => continue,
            };
            let client =
                ResilientSourceClient::new(provider, cfg.clone(), self.policy.clone(), breaker);
            let filter = self.filter.clone();
            let matcher = matcher.clone();
            let query = query.clone();
            let timeout = Duration::from_secs(cfg.timeout_seconds);

            pending.insert(source);
            join.spawn(async move {
                let outcome = tokio::time::timeout(timeout, async {
                    let records = client.fetch_all(query, page_ceiling).await?;
                    let raw = records.len();
                    let mut kept = Vec::with_capacity(raw);
                    for record in records {
                        if filter.classify(&matcher, &record).await.included {
                            kept.push(record);
                        }
                    }
                    Ok::<_, ClientError>((raw, kept))
                })
                .await;

                let result = match outcome {
                    Ok(Ok(pair)) => Ok(pair),
                    Ok(Err(e)) => Err(failure_reason(&e)),
                    Err(_) => Err("timeout".to_string()),
                };
                (source, result)
            });
        }

        // Collect until every task finished or the global deadline fires; any
        // task still pending at the deadline is abandoned and counted failed.
        let deadline = tokio::time::sleep(self.options.global_deadline);
        tokio::pin!(deadline);

        let mut succeeded = 0usize;
        let mut total_raw = 0usize;
        let mut total_filtered = 0usize;
        let mut all_records: Vec<UnifiedRecord> = Vec::new();

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    join.abort_all();
                    break;
                }
                next = join.join_next() => {
                    match next {
                        None => break,
                        Some(Ok((source, Ok((raw, kept))))) => {
                            pending.remove(&source);
                            succeeded += 1;
                            total_raw += raw;
                            total_filtered += kept.len();
                            all_records.extend(kept);
                        }
                        Some(Ok((source, Err(reason)))) => {
                            pending.remove(&source);
                            failures.push(SourceFailure { source, reason });
                        }
                        Some(Err(e)) => {
                            // Panicked or aborted task; attribution comes from
                            // the pending set below.
                            warn!(target: "search", error = %e, "source task aborted");
                        }
                    }
                }
            }
        }
        for source in pending {
            failures.push(SourceFailure {
                source,
                reason: "deadline exceeded".into(),
            });
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if succeeded == 0 {
            counter!("search_failed_total").increment(1);
            warn!(
                target: "search",
                attempted,
                failures = ?failures.iter().map(|f| format!("{}:{}", f.source, f.reason)).collect::<Vec<_>>(),
                elapsed_ms,
                "search failed: no source succeeded"
            );
            return Err(SearchError::AllSourcesUnavailable { failures });
        }

        let records = consolidate(all_records, &priorities);
        let merged = total_filtered.saturating_sub(records.len());
        let is_partial = !failures.is_empty();
        if is_partial {
            counter!("search_partial_total").increment(1);
        }
        counter!("records_kept_total").increment(total_filtered as u64);
        histogram!("search_elapsed_ms").record(elapsed_ms as f64);

        info!(
            target: "search",
            sources_attempted = attempted,
            sources_succeeded = succeeded,
            sources_failed = ?failures.iter().map(|f| format!("{}:{}", f.source, f.reason)).collect::<Vec<_>>(),
            total_raw,
            total_filtered,
            merged,
            records = records.len(),
            is_partial,
            elapsed_ms,
            "search completed"
        );

        Ok(SearchResult {
            records,
            sources_attempted: attempted,
            sources_succeeded: succeeded,
            sources_failed: failures,
            total_raw,
            total_filtered,
            is_partial,
            elapsed_ms,
        })
    }
}

fn failure_reason(e: &ClientError) -> String {
    match e {
        ClientError::CircuitOpen { .. } => "circuit open".to_string(),
        ClientError::Unavailable { last, .. } => format!("unavailable: {last}"),
    }
}
