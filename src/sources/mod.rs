// src/sources/mod.rs
//! # Source registry
//!
//! Static-but-reloadable list of the government portals we aggregate.
//! Loaded from `config/sources.toml` (env `SOURCES_CONFIG_PATH` override)
//! with a built-in seed as fallback, mirroring how the rest of the service
//! treats on-disk config: missing file is never fatal.

pub mod providers;
pub mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::SourceName;

pub const DEFAULT_SOURCES_CONFIG_PATH: &str = "config/sources.toml";
pub const ENV_SOURCES_CONFIG_PATH: &str = "SOURCES_CONFIG_PATH";

/// Per-source static descriptor. Immutable after load; swap the whole
/// registry to change it.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(deserialize_with = "de_source_name")]
    pub code: SourceName,
    pub display_name: String,
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_rps")]
    pub rate_limit_rps: f32,
    /// Lower number wins dedup conflicts.
    pub priority: u8,
    #[serde(default)]
    pub requires_credentials: bool,
    /// Per-source override of the retry budget; None uses the policy default.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_enabled() -> bool {
    true
}
fn default_timeout() -> u64 {
    15
}
fn default_rps() -> f32 {
    2.0
}

fn de_source_name<'de, D>(de: D) -> std::result::Result<SourceName, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    SourceName::parse(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown source code `{raw}`")))
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryRoot {
    sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let root: RegistryRoot = toml::from_str(toml_str).context("parsing sources config")?;
        anyhow::ensure!(!root.sources.is_empty(), "sources config lists no sources");

        // Duplicate codes would make priority lookup ambiguous.
        let mut seen = std::collections::HashSet::new();
        for s in &root.sources {
            anyhow::ensure!(seen.insert(s.code), "duplicate source `{}`", s.code);
        }
        Ok(Self {
            sources: root.sources,
        })
    }

    /// Load using env var + fallbacks:
    /// 1) $SOURCES_CONFIG_PATH (must exist when set)
    /// 2) config/sources.toml
    /// 3) built-in seed
    pub fn load() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_SOURCES_CONFIG_PATH) {
            let pb = PathBuf::from(&p);
            let content = std::fs::read_to_string(&pb)
                .with_context(|| format!("reading sources config at {}", pb.display()))?;
            return Self::from_toml_str(&content);
        }
        let default = PathBuf::from(DEFAULT_SOURCES_CONFIG_PATH);
        if default.exists() {
            let content = std::fs::read_to_string(&default)
                .with_context(|| format!("reading sources config at {}", default.display()))?;
            return Self::from_toml_str(&content);
        }
        Ok(Self::default_seed())
    }

    /// Built-in registry used when no config file is present. Priorities
    /// reflect structured-data quality, not popularity.
    pub fn default_seed() -> Self {
        let mk = |code: SourceName,
                  display_name: &str,
                  base_url: &str,
                  enabled: bool,
                  timeout_seconds: u64,
                  rate_limit_rps: f32,
                  priority: u8,
                  requires_credentials: bool| SourceConfig {
            code,
            display_name: display_name.to_string(),
            base_url: base_url.to_string(),
            enabled,
            timeout_seconds,
            rate_limit_rps,
            priority,
            requires_credentials,
            max_retries: None,
        };

        Self {
            sources: vec![
                mk(
                    SourceName::Pncp,
                    "Portal Nacional de Contratações Públicas",
                    "https://pncp.gov.br/api/consulta",
                    true,
                    15,
                    2.0,
                    1,
                    false,
                ),
                mk(
                    SourceName::Comprasnet,
                    "Compras.gov.br",
                    "https://compras.dados.gov.br",
                    true,
                    15,
                    2.0,
                    2,
                    false,
                ),
                mk(
                    SourceName::Transparencia,
                    "Portal da Transparência",
                    "https://api.portaldatransparencia.gov.br/api-de-dados",
                    true,
                    20,
                    1.0,
                    3,
                    true,
                ),
                mk(
                    SourceName::Dou,
                    "Diário Oficial da União (RSS)",
                    "https://www.in.gov.br/leiturajornal",
                    true,
                    20,
                    0.5,
                    4,
                    false,
                ),
                // Experimental; prose extraction quality is still being tuned.
                mk(
                    SourceName::QueridoDiario,
                    "Querido Diário",
                    "https://queridodiario.ok.org.br/api",
                    false,
                    20,
                    1.0,
                    5,
                    false,
                ),
            ],
        }
    }

    pub fn get(&self, code: SourceName) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.code == code)
    }

    /// Enabled sources sorted by ascending priority.
    pub fn enabled(&self) -> Vec<&SourceConfig> {
        let mut out: Vec<&SourceConfig> = self.sources.iter().filter(|s| s.enabled).collect();
        out.sort_by_key(|s| s.priority);
        out
    }

    pub fn all(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// Priority map consumed by the consolidator.
    pub fn priorities(&self) -> HashMap<SourceName, u8> {
        self.sources.iter().map(|s| (s.code, s.priority)).collect()
    }
}

/// Thread-safe handle allowing the admin endpoint to swap the registry
/// without restarting in-flight searches.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<RwLock<SourceRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: SourceRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub fn snapshot(&self) -> SourceRegistry {
        self.inner
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|_| SourceRegistry::default_seed())
    }

    /// Re-read config from disk and swap atomically. Keeps the old registry
    /// on any load error.
    pub fn reload(&self) -> Result<usize> {
        let fresh = SourceRegistry::load()?;
        let n = fresh.all().len();
        if let Ok(mut guard) = self.inner.write() {
            *guard = fresh;
        }
        Ok(n)
    }
}
