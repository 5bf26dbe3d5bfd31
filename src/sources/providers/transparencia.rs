// src/sources/providers/transparencia.rs
//! Portal da Transparência. Credentialed JSON API (`chave-api-dados` header);
//! responses are bare arrays, so continuation is inferred from page fill.

use async_trait::async_trait;
use chrono::NaiveDate;
use metrics::{counter, histogram};
use serde::Deserialize;

use crate::model::{normalize_cnpj, SourceName, UnifiedRecord};
use crate::sources::providers::{get_text, http_client};
use crate::sources::types::{FetchError, SourcePage, SourceProvider, SourceQuery};
use crate::sources::SourceConfig;

const API_KEY_HEADER: &str = "chave-api-dados";

#[derive(Debug, Deserialize)]
struct TransparenciaItem {
    id: u64,
    licitacao: LicitacaoInfo,
    #[serde(rename = "unidadeGestora")]
    unidade_gestora: UnidadeGestora,
    #[serde(rename = "municipio", default)]
    municipio: Option<Municipio>,
    #[serde(rename = "dataPublicacao")]
    data_publicacao: Option<String>,
    #[serde(rename = "dataAbertura")]
    data_abertura: Option<String>,
    #[serde(rename = "valorLicitacao")]
    valor: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LicitacaoInfo {
    #[serde(default)]
    objeto: String,
    #[serde(rename = "numeroLicitacao")]
    numero: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnidadeGestora {
    #[serde(default)]
    cnpj: String,
    #[serde(default)]
    nome: String,
}

#[derive(Debug, Deserialize)]
struct Municipio {
    #[serde(rename = "nomeIBGE", default)]
    nome: String,
    #[serde(default)]
    uf: Option<Uf>,
}

#[derive(Debug, Deserialize)]
struct Uf {
    #[serde(default)]
    sigla: String,
}

pub struct TransparenciaProvider {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        client: reqwest::Client,
        api_key: String,
    },
}

impl TransparenciaProvider {
    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
        }
    }

    pub fn from_config(cfg: &SourceConfig, api_key: String) -> Self {
        Self {
            mode: Mode::Http {
                base_url: cfg.base_url.trim_end_matches('/').to_string(),
                client: http_client(cfg.timeout_seconds),
                api_key,
            },
        }
    }

    fn parse_page(body: &str, page: u32, page_size: u32) -> Result<SourcePage, FetchError> {
        let t0 = std::time::Instant::now();
        let items: Vec<TransparenciaItem> =
            serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
        let fetched = items.len();

        let mut records = Vec::with_capacity(fetched);
        for it in items {
            let Some(publication_date) = it
                .data_publicacao
                .as_deref()
                .and_then(parse_br_date)
            else {
                continue;
            };
            let fiscal_year = it
                .licitacao
                .numero
                .as_deref()
                .and_then(crate::sources::providers::extract::fiscal_year_of)
                .or_else(|| {
                    use chrono::Datelike;
                    Some(publication_date.year())
                });
            let (municipality, state_code) = match &it.municipio {
                Some(m) => (
                    m.nome.clone(),
                    m.uf.as_ref().map(|u| u.sigla.to_ascii_uppercase()).unwrap_or_default(),
                ),
                None => (String::new(), String::new()),
            };
            records.push(UnifiedRecord {
                source_id: it.id.to_string(),
                source_name: SourceName::Transparencia,
                object_description: it.licitacao.objeto,
                estimated_value: it.valor,
                agency_cnpj: normalize_cnpj(&it.unidade_gestora.cnpj),
                agency_name: it.unidade_gestora.nome,
                state_code,
                municipality,
                publication_date,
                opening_date: it.data_abertura.as_deref().and_then(|d| {
                    parse_br_date(d).and_then(|date| date.and_hms_opt(0, 0, 0))
                }),
                edital_number: it.licitacao.numero.filter(|n| !n.trim().is_empty()),
                fiscal_year,
                link: format!(
                    "https://portaldatransparencia.gov.br/licitacoes/{}",
                    it.id
                ),
                extraction_confidence: 1.0,
            });
        }

        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("records_raw_total", "source" => "transparencia")
            .increment(records.len() as u64);
        Ok(SourcePage {
            records,
            current_page: page,
            total_reported: None,
            // A full page suggests another one behind it.
            has_more: fetched as u32 >= page_size,
        })
    }
}

/// The portal emits dd/mm/yyyy.
fn parse_br_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d/%m/%Y").ok()
}

#[async_trait]
impl SourceProvider for TransparenciaProvider {
    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => {
                let mut parsed = Self::parse_page(s, page, query.page_size)?;
                parsed.has_more = false;
                Ok(parsed)
            }
            Mode::Http {
                base_url,
                client,
                api_key,
            } => {
                let url = format!(
                    "{}/licitacoes?dataInicial={}&dataFinal={}&pagina={}",
                    base_url,
                    query.date_from.format("%d/%m/%Y"),
                    query.date_to.format("%d/%m/%Y"),
                    page,
                );
                let body =
                    get_text(client, &url, &[(API_KEY_HEADER, api_key.clone())]).await?;
                Self::parse_page(&body, page, query.page_size)
            }
        }
    }

    fn source(&self) -> SourceName {
        SourceName::Transparencia
    }
}
