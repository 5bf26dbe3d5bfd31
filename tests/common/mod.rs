// tests/common/mod.rs
//! Shared fixtures for the integration suites: fake source providers and
//! orchestrator builders that never touch the network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use licita_radar::cache::store::NullStore;
use licita_radar::cache::{CacheConfig, CacheLayer};
use licita_radar::classify::arbiter::{ArbiterMode, LlmArbiter, MockArbiter};
use licita_radar::classify::{ClassificationFilter, KeywordConfig};
use licita_radar::model::{SearchRequest, SourceName, UnifiedRecord};
use licita_radar::orchestrator::{SearchOptions, SearchOrchestrator};
use licita_radar::resilience::breaker::BreakerConfig;
use licita_radar::resilience::{BreakerRegistry, RetryPolicy};
use licita_radar::sources::types::{FetchError, SourcePage, SourceProvider, SourceQuery};
use licita_radar::sources::{RegistryHandle, SourceRegistry};

/// All five sources enabled, no pacing, short timeouts.
pub fn registry_all_enabled() -> SourceRegistry {
    let toml = r#"
[[sources]]
code = "pncp"
display_name = "PNCP"
base_url = "https://pncp.test"
timeout_seconds = 5
rate_limit_rps = 0.0
priority = 1

[[sources]]
code = "comprasnet"
display_name = "Comprasnet"
base_url = "https://comprasnet.test"
timeout_seconds = 5
rate_limit_rps = 0.0
priority = 2

[[sources]]
code = "transparencia"
display_name = "Transparencia"
base_url = "https://transparencia.test"
timeout_seconds = 5
rate_limit_rps = 0.0
priority = 3

[[sources]]
code = "dou"
display_name = "DOU"
base_url = "https://dou.test"
timeout_seconds = 5
rate_limit_rps = 0.0
priority = 4

[[sources]]
code = "querido_diario"
display_name = "Querido Diario"
base_url = "https://qd.test"
timeout_seconds = 5
rate_limit_rps = 0.0
priority = 5
"#;
    SourceRegistry::from_toml_str(toml).expect("test registry")
}

pub fn record(source: SourceName, id: &str, cnpj: &str, edital: &str, year: i32) -> UnifiedRecord {
    UnifiedRecord {
        source_id: id.into(),
        source_name: source,
        object_description: "Aquisição de merenda escolar para a rede municipal".into(),
        estimated_value: Some(250_000.0),
        agency_cnpj: cnpj.into(),
        agency_name: "Prefeitura Municipal".into(),
        state_code: "SP".into(),
        municipality: "Campinas".into(),
        publication_date: NaiveDate::from_ymd_opt(2025, 5, 10).unwrap(),
        opening_date: None,
        edital_number: Some(edital.into()),
        fiscal_year: Some(year),
        link: format!("https://example.gov.br/{id}"),
        extraction_confidence: 1.0,
    }
}

/// Serves the same single page on every call and counts calls.
pub struct StaticSource {
    source: SourceName,
    records: Vec<UnifiedRecord>,
    pub calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(source: SourceName, records: Vec<UnifiedRecord>) -> Arc<Self> {
        Arc::new(Self {
            source,
            records,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SourceProvider for StaticSource {
    async fn fetch_page(&self, _query: &SourceQuery, page: u32) -> Result<SourcePage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SourcePage {
            records: self.records.clone(),
            current_page: page,
            total_reported: Some(self.records.len() as u64),
            has_more: false,
        })
    }
    fn source(&self) -> SourceName {
        self.source
    }
}

/// Always fails with the given HTTP status.
pub struct FailingSource {
    source: SourceName,
    status: u16,
}

impl FailingSource {
    pub fn new(source: SourceName, status: u16) -> Arc<Self> {
        Arc::new(Self { source, status })
    }
}

#[async_trait::async_trait]
impl SourceProvider for FailingSource {
    async fn fetch_page(&self, _query: &SourceQuery, _page: u32) -> Result<SourcePage, FetchError> {
        Err(FetchError::from_status(self.status, None))
    }
    fn source(&self) -> SourceName {
        self.source
    }
}

/// Never responds; exercises per-source timeouts and the global deadline.
pub struct HangingSource {
    source: SourceName,
}

impl HangingSource {
    pub fn new(source: SourceName) -> Arc<Self> {
        Arc::new(Self { source })
    }
}

#[async_trait::async_trait]
impl SourceProvider for HangingSource {
    async fn fetch_page(&self, _query: &SourceQuery, _page: u32) -> Result<SourcePage, FetchError> {
        std::future::pending::<()>().await;
        unreachable!()
    }
    fn source(&self) -> SourceName {
        self.source
    }
}

pub fn filter_with_mock(arbiter: MockArbiter) -> Arc<ClassificationFilter> {
    Arc::new(ClassificationFilter::new(
        &KeywordConfig::default_seed(),
        Arc::new(LlmArbiter::for_tests(arbiter)),
        ArbiterMode::Standard,
    ))
}

pub struct OrchestratorBuilder {
    registry: SourceRegistry,
    providers: Vec<(SourceName, Arc<dyn SourceProvider>)>,
    filter: Arc<ClassificationFilter>,
    cache_cfg: CacheConfig,
    policy: RetryPolicy,
    options: SearchOptions,
    breakers: BreakerRegistry,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            registry: registry_all_enabled(),
            providers: Vec::new(),
            filter: filter_with_mock(MockArbiter::failing()),
            cache_cfg: CacheConfig::default(),
            policy: RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_retries: 0,
                ..RetryPolicy::default()
            },
            options: SearchOptions::default(),
            breakers: BreakerRegistry::new(BreakerConfig::default()),
        }
    }

    pub fn registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn provider(mut self, source: SourceName, provider: Arc<dyn SourceProvider>) -> Self {
        self.providers.push((source, provider));
        self
    }

    pub fn filter(mut self, filter: Arc<ClassificationFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn cache_cfg(mut self, cfg: CacheConfig) -> Self {
        self.cache_cfg = cfg;
        self
    }

    pub fn options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn breakers(&self) -> BreakerRegistry {
        self.breakers.clone()
    }

    pub fn build(self) -> SearchOrchestrator {
        let cache = CacheLayer::new(Arc::new(NullStore), self.cache_cfg);
        let mut orchestrator = SearchOrchestrator::new(
            RegistryHandle::new(self.registry),
            self.breakers,
            self.filter,
            cache,
            self.policy,
            self.options,
        );
        for (source, provider) in self.providers {
            orchestrator = orchestrator.with_provider(source, provider);
        }
        orchestrator
    }
}

/// Recent window so plan history checks pass regardless of when the suite
/// runs.
pub fn search_request() -> SearchRequest {
    let today = chrono::Utc::now().date_naive();
    SearchRequest {
        keywords: None,
        states: vec!["SP".into()],
        date_from: today - chrono::Days::new(30),
        date_to: today,
        max_pages: None,
    }
}
