// src/sources/providers/mod.rs
//! One module per portal. Every provider supports two construction modes,
//! `Http` for production and `Fixture` for tests, so the whole pipeline can
//! be exercised against recorded payloads without network access.

pub mod comprasnet;
pub mod dou_rss;
pub mod extract;
pub mod pncp;
pub mod querido_diario;
pub mod transparencia;

use std::sync::Arc;
use std::time::Duration;

use crate::sources::types::{parse_retry_after, FetchError, SourceProvider};
use crate::sources::SourceConfig;

pub const ENV_TRANSPARENCIA_API_KEY: &str = "TRANSPARENCIA_API_KEY";

/// Shared reqwest client builder so every portal gets the same connect
/// timeout and UA. The per-request timeout comes from the source config.
pub(crate) fn http_client(timeout_seconds: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("licita-radar/0.1 (+licitacoes aggregator)")
        .connect_timeout(Duration::from_secs(4))
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .build()
        .expect("reqwest client")
}

/// GET a URL and return the body, translating transport and status failures
/// into the fetch taxonomy. `headers` carries portal credentials when needed.
pub(crate) async fn get_text(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
) -> Result<String, FetchError> {
    let mut req = client.get(url);
    for (name, value) in headers {
        req = req.header(*name, value.as_str());
    }
    let resp = req.send().await.map_err(FetchError::from_reqwest)?;
    let status = resp.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(resp.headers());
        return Err(FetchError::from_status(status.as_u16(), retry_after));
    }
    resp.text().await.map_err(FetchError::from_reqwest)
}

/// Build the provider for a configured source. Returns `None` when the source
/// needs credentials that are not present in the environment; the caller
/// logs and treats it as disabled rather than failing boot.
pub fn build_provider(cfg: &SourceConfig) -> Option<Arc<dyn SourceProvider>> {
    use crate::model::SourceName;
    match cfg.code {
        SourceName::Pncp => Some(Arc::new(pncp::PncpProvider::from_config(cfg))),
        SourceName::Comprasnet => Some(Arc::new(comprasnet::ComprasnetProvider::from_config(cfg))),
        SourceName::Transparencia => {
            let key = std::env::var(ENV_TRANSPARENCIA_API_KEY).unwrap_or_default();
            if key.is_empty() {
                return None;
            }
            Some(Arc::new(transparencia::TransparenciaProvider::from_config(
                cfg, key,
            )))
        }
        SourceName::Dou => Some(Arc::new(dou_rss::DouRssProvider::from_config(cfg))),
        SourceName::QueridoDiario => Some(Arc::new(
            querido_diario::QueridoDiarioProvider::from_config(cfg),
        )),
    }
}
