// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::cache::CacheConfig;

/// One-time metric registration so every series shows up on /metrics.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("search_requests_total", "Searches started (uncached computes).");
        describe_counter!("search_partial_total", "Searches completed with at least one failed source.");
        describe_counter!("search_failed_total", "Searches where every source failed.");
        describe_counter!("source_pages_total", "Pages fetched successfully, by source.");
        describe_counter!("source_fetch_retries_total", "Transient-failure retries, by source.");
        describe_counter!("source_failures_total", "Calls that exhausted retries or failed fatally.");
        describe_counter!(
            "source_skipped_circuit_total",
            "Calls short-circuited by an open breaker."
        );
        describe_counter!("breaker_transitions_total", "Circuit breaker state changes.");
        describe_counter!("records_raw_total", "Records parsed from providers, by source.");
        describe_counter!("records_kept_total", "Records surviving classification.");
        describe_counter!("records_merged_total", "Records collapsed by consolidation.");
        describe_counter!("records_excluded_total", "Records dropped by the filter, by reason.");
        describe_counter!("cache_hits_total", "Cache hits, by tier.");
        describe_counter!("cache_stale_total", "Stale cache serves.");
        describe_counter!("cache_misses_total", "Cache misses computed inline.");
        describe_counter!("cache_revalidations_total", "Background refreshes started.");
        describe_counter!(
            "cache_revalidations_skipped_total",
            "Refreshes skipped because the global budget was exhausted."
        );
        describe_counter!("arbiter_calls_total", "LLM arbitration calls, by provider.");
        describe_counter!("arbiter_failures_total", "Arbitrations that failed closed.");
        describe_counter!("quota_rejected_total", "Requests rejected by caller quota.");
        describe_counter!("quota_evictions_total", "Quota buckets evicted at the key ceiling.");
        describe_histogram!("ingest_parse_ms", "Provider payload parse time in milliseconds.");
        describe_histogram!("search_elapsed_ms", "End-to-end fan-out time in milliseconds.");
        describe_gauge!("cache_memory_fresh_ttl_seconds", "Baseline in-process fresh TTL.");
        describe_gauge!("cache_durable_ttl_seconds", "Durable tier TTL.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish the static TTL gauges.
    pub fn init(cache_cfg: &CacheConfig) -> Self {
        ensure_metrics_described();
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");

        gauge!("cache_memory_fresh_ttl_seconds").set(cache_cfg.memory_fresh_ttl.as_secs_f64());
        gauge!("cache_durable_ttl_seconds").set(cache_cfg.durable_ttl.as_secs_f64());

        Self { handle }
    }

    /// Router exposing `/metrics` in Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
