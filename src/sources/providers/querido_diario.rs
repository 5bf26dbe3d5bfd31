// src/sources/providers/querido_diario.rs
//! Querido Diário: municipal gazette excerpts. Experimental source
//! (disabled by default in the registry): records come from full-text
//! matches in scanned gazettes, so extraction quality varies widely.

use async_trait::async_trait;
use chrono::NaiveDate;
use metrics::{counter, histogram};
use serde::Deserialize;

use crate::model::{SourceName, UnifiedRecord};
use crate::sources::providers::{extract, get_text, http_client};
use crate::sources::types::{FetchError, SourcePage, SourceProvider, SourceQuery};
use crate::sources::SourceConfig;

/// Lower floor than DOU; OCR noise is common in municipal gazettes.
const BASE_CONFIDENCE: f32 = 0.2;

#[derive(Debug, Deserialize)]
struct GazettesResponse {
    #[serde(default)]
    total_gazettes: u64,
    #[serde(default)]
    gazettes: Vec<Gazette>,
}

#[derive(Debug, Deserialize)]
struct Gazette {
    territory_id: String,
    #[serde(default)]
    territory_name: String,
    #[serde(default)]
    state_code: String,
    date: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    excerpts: Vec<String>,
}

pub struct QueridoDiarioProvider {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        client: reqwest::Client,
    },
}

impl QueridoDiarioProvider {
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

    fn parse_page(body: &str, page: u32, page_size: u32) -> Result<SourcePage, FetchError> {
        let t0 = std::time::Instant::now();
        let resp: GazettesResponse =
            serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;

        let gazette_count = resp.gazettes.len();
        let mut records = Vec::new();
        for gz in resp.gazettes {
            let Some(publication_date) = NaiveDate::parse_from_str(&gz.date, "%Y-%m-%d").ok()
            else {
                continue;
            };
            for (idx, excerpt) in gz.excerpts.iter().enumerate() {
                let text = crate::classify::normalize_text(excerpt);
                if text.is_empty() {
                    continue;
                }
                let cnpj = extract::cnpj_in(excerpt);
                let edital = extract::edital_number_in(excerpt);
                let value = extract::money_value_in(excerpt);
                let fiscal_year = edital.as_deref().and_then(extract::fiscal_year_of);
                records.push(UnifiedRecord {
                    source_id: format!("{}:{}:{}", gz.territory_id, gz.date, idx),
                    source_name: SourceName::QueridoDiario,
                    object_description: text,
                    estimated_value: value,
                    agency_cnpj: cnpj.clone().unwrap_or_default(),
                    agency_name: String::new(),
                    state_code: gz.state_code.to_ascii_uppercase(),
                    municipality: gz.territory_name.clone(),
                    publication_date,
                    opening_date: None,
                    edital_number: edital.clone(),
                    fiscal_year,
                    link: gz.url.clone(),
                    extraction_confidence: extract::confidence(
                        BASE_CONFIDENCE,
                        &cnpj,
                        &edital,
                        &value,
                    ),
                });
            }
        }

        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("records_raw_total", "source" => "querido_diario")
            .increment(records.len() as u64);
        Ok(SourcePage {
            records,
            current_page: page,
            total_reported: Some(resp.total_gazettes),
            has_more: gazette_count as u32 >= page_size,
        })
    }
}

#[async_trait]
impl SourceProvider for QueridoDiarioProvider {
    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => {
                let mut parsed = Self::parse_page(s, page, query.page_size)?;
                parsed.has_more = false;
                Ok(parsed)
            }
            Mode::Http { base_url, client } => {
                let offset = (page.saturating_sub(1)) * query.page_size;
                let url = format!(
                    "{}/gazettes?querystring=licita%C3%A7%C3%A3o&published_since={}&published_until={}&offset={}&size={}",
                    base_url, query.date_from, query.date_to, offset, query.page_size,
                );
                let body = get_text(client, &url, &[]).await?;
                Self::parse_page(&body, page, query.page_size)
            }
        }
    }

    fn source(&self) -> SourceName {
        SourceName::QueridoDiario
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "total_gazettes": 1,
        "gazettes": [
            {
                "territory_id": "3550308",
                "territory_name": "São Paulo",
                "state_code": "SP",
                "date": "2025-05-12",
                "url": "https://queridodiario.ok.org.br/gazette/3550308/2025-05-12",
                "excerpts": [
                    "Edital nº 102/2025. Aquisição de material hospitalar, CNPJ 11.222.333/0001-44, valor R$ 89.500,00.",
                    ""
                ]
            }
        ]
    }"#;

    #[test]
    fn one_record_per_non_empty_excerpt() {
        let page = QueridoDiarioProvider::parse_page(FIXTURE, 1, 10).unwrap();
        assert_eq!(page.records.len(), 1, "empty excerpt skipped");
        let r = &page.records[0];
        assert_eq!(r.source_id, "3550308:2025-05-12:0");
        assert_eq!(r.municipality, "São Paulo");
        assert_eq!(r.agency_cnpj, "11222333000144");
        assert_eq!(r.edital_number.as_deref(), Some("102/2025"));
        assert!(r.extraction_confidence < 0.9);
    }
}
