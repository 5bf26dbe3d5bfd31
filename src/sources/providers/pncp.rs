// src/sources/providers/pncp.rs
//! PNCP, the Portal Nacional de Contratações Públicas. Structured JSON API with
//! explicit pagination metadata; the highest-quality source we have.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use metrics::{counter, histogram};
use serde::Deserialize;

use crate::model::{normalize_cnpj, SourceName, UnifiedRecord};
use crate::sources::providers::{get_text, http_client};
use crate::sources::types::{FetchError, SourcePage, SourceProvider, SourceQuery};
use crate::sources::SourceConfig;

#[derive(Debug, Deserialize)]
struct PncpResponse {
    #[serde(default)]
    data: Vec<PncpItem>,
    #[serde(rename = "totalRegistros")]
    total_registros: Option<u64>,
    #[serde(rename = "totalPaginas")]
    total_paginas: Option<u32>,
    #[serde(rename = "numeroPagina")]
    numero_pagina: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PncpItem {
    #[serde(rename = "numeroControlePNCP")]
    numero_controle: String,
    #[serde(rename = "objetoCompra", default)]
    objeto: String,
    #[serde(rename = "valorTotalEstimado")]
    valor_total_estimado: Option<f64>,
    #[serde(rename = "orgaoEntidade")]
    orgao: PncpOrgao,
    #[serde(rename = "unidadeOrgao")]
    unidade: PncpUnidade,
    #[serde(rename = "dataPublicacaoPncp")]
    data_publicacao: String,
    #[serde(rename = "dataAberturaProposta")]
    data_abertura: Option<String>,
    #[serde(rename = "numeroCompra")]
    numero_compra: Option<String>,
    #[serde(rename = "anoCompra")]
    ano_compra: Option<i32>,
    #[serde(rename = "linkSistemaOrigem")]
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PncpOrgao {
    #[serde(default)]
    cnpj: String,
    #[serde(rename = "razaoSocial", default)]
    razao_social: String,
}

#[derive(Debug, Deserialize)]
struct PncpUnidade {
    #[serde(rename = "ufSigla", default)]
    uf: String,
    #[serde(rename = "municipioNome", default)]
    municipio: String,
}

pub struct PncpProvider {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        client: reqwest::Client,
    },
}

impl PncpProvider {
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

    fn parse_page(body: &str, requested_page: u32) -> Result<SourcePage, FetchError> {
        let t0 = std::time::Instant::now();
        let resp: PncpResponse =
            serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;

        let mut records = Vec::with_capacity(resp.data.len());
        for it in resp.data {
            let publication_date = parse_date(&it.data_publicacao);
            let Some(publication_date) = publication_date else {
                // A notice without a publication date cannot be windowed; skip it.
                continue;
            };
            records.push(UnifiedRecord {
                source_id: it.numero_controle.clone(),
                source_name: SourceName::Pncp,
                object_description: it.objeto,
                estimated_value: it.valor_total_estimado,
                agency_cnpj: normalize_cnpj(&it.orgao.cnpj),
                agency_name: it.orgao.razao_social,
                state_code: it.unidade.uf.to_ascii_uppercase(),
                municipality: it.unidade.municipio,
                publication_date,
                opening_date: it.data_abertura.as_deref().and_then(parse_datetime),
                edital_number: it.numero_compra.filter(|n| !n.trim().is_empty()),
                fiscal_year: it.ano_compra,
                link: it
                    .link
                    .unwrap_or_else(|| format!("https://pncp.gov.br/app/editais/{}", it.numero_controle)),
                extraction_confidence: 1.0,
            });
        }

        let current_page = resp.numero_pagina.unwrap_or(requested_page);
        let has_more = match resp.total_paginas {
            Some(total) => current_page < total,
            None => false,
        };

        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("records_raw_total", "source" => "pncp").increment(records.len() as u64);
        Ok(SourcePage {
            records,
            current_page,
            total_reported: resp.total_registros,
            has_more,
        })
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    // The API emits ISO datetimes; tolerate bare dates too.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.date())
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok()
}

#[async_trait]
impl SourceProvider for PncpProvider {
    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => {
                let mut parsed = Self::parse_page(s, page)?;
                // Fixtures are a single page; never report continuation.
                parsed.has_more = false;
                Ok(parsed)
            }
            Mode::Http { base_url, client } => {
                let mut url = format!(
                    "{}/v1/contratacoes/publicacao?dataInicial={}&dataFinal={}&pagina={}&tamanhoPagina={}",
                    base_url,
                    query.date_from.format("%Y%m%d"),
                    query.date_to.format("%Y%m%d"),
                    page,
                    query.page_size,
                );
                // PNCP filters by a single UF per request; pass the first and
                // let the classifier narrow the rest.
                if let Some(uf) = query.states.first() {
                    url.push_str(&format!("&uf={uf}"));
                }
                let body = get_text(client, &url, &[]).await?;
                Self::parse_page(&body, page)
            }
        }
    }

    fn source(&self) -> SourceName {
        SourceName::Pncp
    }
}
