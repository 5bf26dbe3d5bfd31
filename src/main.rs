//! Procurement search service: binary entrypoint.
//! Boots the Axum HTTP server, wiring config, shared state, and middleware.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use licita_radar::api::{self, AppState};
use licita_radar::cache::store::FileStore;
use licita_radar::cache::{CacheConfig, CacheLayer};
use licita_radar::classify::arbiter::{build_arbiter_from_config, load_arbiter_config, ArbiterMode};
use licita_radar::classify::{ClassificationFilter, KeywordConfig};
use licita_radar::metrics::Metrics;
use licita_radar::orchestrator::{SearchOptions, SearchOrchestrator};
use licita_radar::plan::{CachedPlans, PlanLimits, StaticPlans};
use licita_radar::quota::{QuotaConfig, QuotaGuard};
use licita_radar::resilience::breaker::BreakerConfig;
use licita_radar::resilience::{BreakerRegistry, RetryPolicy};
use licita_radar::sources::{RegistryHandle, SourceRegistry};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    // --- Config ---
    let registry = RegistryHandle::new(SourceRegistry::load()?);
    let keywords = KeywordConfig::load().context("loading keywords config")?;
    let arbiter_cfg = load_arbiter_config();
    let arbiter = build_arbiter_from_config(&arbiter_cfg);
    let mode = ArbiterMode::parse(arbiter_cfg.mode.as_deref().unwrap_or("standard"));
    info!(
        arbiter = arbiter.provider_name(),
        sources = registry.snapshot().all().len(),
        "configuration loaded"
    );

    // --- Shared state ---
    let cache_cfg = CacheConfig::default();
    let metrics = Metrics::init(&cache_cfg);
    let cache_dir = std::env::var("CACHE_DIR").unwrap_or_else(|_| "cache/results".to_string());
    let cache = CacheLayer::new(Arc::new(FileStore::new(cache_dir)), cache_cfg);
    let filter = Arc::new(ClassificationFilter::new(&keywords, arbiter, mode));
    let orchestrator = Arc::new(SearchOrchestrator::new(
        registry.clone(),
        BreakerRegistry::new(BreakerConfig::default()),
        filter,
        cache,
        RetryPolicy::default(),
        SearchOptions::from_env(),
    ));

    let state = AppState {
        orchestrator,
        quota: Arc::new(QuotaGuard::new(QuotaConfig::default())),
        plans: Arc::new(CachedPlans::new(
            Box::new(StaticPlans(PlanLimits::default())),
            Duration::from_secs(600),
        )),
        registry,
    };

    let app = api::router(state).merge(metrics.router());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
