// src/sources/providers/comprasnet.rs
//! Compras.gov.br open-data API. HAL-style JSON with offset pagination; no
//! page totals up front, so continuation is inferred from the `next` link.

use async_trait::async_trait;
use chrono::NaiveDate;
use metrics::{counter, histogram};
use serde::Deserialize;

use crate::model::{normalize_cnpj, SourceName, UnifiedRecord};
use crate::sources::providers::{get_text, http_client};
use crate::sources::types::{FetchError, SourcePage, SourceProvider, SourceQuery};
use crate::sources::SourceConfig;

#[derive(Debug, Deserialize)]
struct ComprasnetResponse {
    #[serde(rename = "_embedded", default)]
    embedded: Embedded,
    count: Option<u64>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Embedded {
    #[serde(default)]
    licitacoes: Vec<Licitacao>,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    next: Option<Href>,
}

#[derive(Debug, Deserialize)]
struct Href {
    #[allow(dead_code)]
    href: String,
}

#[derive(Debug, Deserialize)]
struct Licitacao {
    identificador: String,
    #[serde(default)]
    objeto: String,
    valor_estimado: Option<f64>,
    #[serde(default)]
    cnpj_orgao: String,
    #[serde(default)]
    nome_orgao: String,
    #[serde(default)]
    uf: String,
    #[serde(default)]
    municipio: String,
    data_publicacao: Option<String>,
    data_abertura_proposta: Option<String>,
    numero_aviso: Option<String>,
    ano_compra: Option<i32>,
    #[serde(default)]
    url: String,
}

pub struct ComprasnetProvider {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        client: reqwest::Client,
    },
}

impl ComprasnetProvider {
    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
        }
    }

    pub fn from_config(cfg: &SourceConfig) -> Self {
        Self {
            mode: Mode::Http {
                base_url: cfg.base_url.trim_end_matches('/').to_string(),
                client: http_client(cfg.timeout_seconds),
            },
        }
    }

    fn parse_page(body: &str, page: u32) -> Result<SourcePage, FetchError> {
        let t0 = std::time::Instant::now();
        let resp: ComprasnetResponse =
            serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;

        let mut records = Vec::with_capacity(resp.embedded.licitacoes.len());
        for it in resp.embedded.licitacoes {
            let Some(publication_date) = it
                .data_publicacao
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            let fiscal_year = it.ano_compra.or_else(|| {
                use chrono::Datelike;
                Some(publication_date.year())
            });
            records.push(UnifiedRecord {
                source_id: it.identificador.clone(),
                source_name: SourceName::Comprasnet,
                object_description: it.objeto,
                estimated_value: it.valor_estimado,
                agency_cnpj: normalize_cnpj(&it.cnpj_orgao),
                agency_name: it.nome_orgao,
                state_code: it.uf.to_ascii_uppercase(),
                municipality: it.municipio,
                publication_date,
                opening_date: it.data_abertura_proposta.as_deref().and_then(|d| {
                    chrono::NaiveDateTime::parse_from_str(d, "%Y-%m-%dT%H:%M:%S").ok()
                }),
                edital_number: it.numero_aviso.filter(|n| !n.trim().is_empty()),
                fiscal_year,
                link: if it.url.is_empty() {
                    format!(
                        "https://compras.dados.gov.br/licitacoes/doc/licitacao/{}",
                        it.identificador
                    )
                } else {
                    it.url
                },
                extraction_confidence: 1.0,
            });
        }

        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("records_raw_total", "source" => "comprasnet").increment(records.len() as u64);
        Ok(SourcePage {
            records,
            current_page: page,
            total_reported: resp.count,
            has_more: resp.links.next.is_some(),
        })
    }
}

#[async_trait]
impl SourceProvider for ComprasnetProvider {
    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => {
                let mut parsed = Self::parse_page(s, page)?;
                parsed.has_more = false;
                Ok(parsed)
            }
            Mode::Http { base_url, client } => {
                let offset = (page.saturating_sub(1)) * query.page_size;
                let mut url = format!(
                    "{}/licitacoes/v1/licitacoes.json?data_publicacao_min={}&data_publicacao_max={}&offset={}",
                    base_url, query.date_from, query.date_to, offset,
                );
                if let Some(uf) = query.states.first() {
                    url.push_str(&format!("&uf={uf}"));
                }
                let body = get_text(client, &url, &[]).await?;
                Self::parse_page(&body, page)
            }
        }
    }

    fn source(&self) -> SourceName {
        SourceName::Comprasnet
    }
}
