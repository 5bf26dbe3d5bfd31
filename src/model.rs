// src/model.rs
//! Canonical data model shared by every stage of the pipeline: the unified
//! procurement record, the search request/result pair, and the derived
//! identity keys (dedup key, cache fingerprint).

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Registered data sources. The registry (`crate::sources`) maps each variant
/// to its endpoint configuration and conflict priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    Pncp,
    Comprasnet,
    Transparencia,
    Dou,
    QueridoDiario,
}

impl SourceName {
    /// Stable machine code used in configs, metrics labels, and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SourceName::Pncp => "pncp",
            SourceName::Comprasnet => "comprasnet",
            SourceName::Transparencia => "transparencia",
            SourceName::Dou => "dou",
            SourceName::QueridoDiario => "querido_diario",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "pncp" => Some(SourceName::Pncp),
            "comprasnet" => Some(SourceName::Comprasnet),
            "transparencia" => Some(SourceName::Transparencia),
            "dou" => Some(SourceName::Dou),
            "querido_diario" => Some(SourceName::QueridoDiario),
            _ => None,
        }
    }

    pub fn all() -> [SourceName; 5] {
        [
            SourceName::Pncp,
            SourceName::Comprasnet,
            SourceName::Transparencia,
            SourceName::Dou,
            SourceName::QueridoDiario,
        ]
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One procurement notice, normalized to a common shape regardless of which
/// portal produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnifiedRecord {
    /// Identifier assigned by the originating source.
    pub source_id: String,
    pub source_name: SourceName,
    pub object_description: String,
    /// May be absent or zero; portals disagree on whether estimates are public.
    pub estimated_value: Option<f64>,
    /// Digits only; empty when the source did not publish it.
    pub agency_cnpj: String,
    pub agency_name: String,
    pub state_code: String,
    pub municipality: String,
    pub publication_date: NaiveDate,
    pub opening_date: Option<NaiveDateTime>,
    pub edital_number: Option<String>,
    pub fiscal_year: Option<i32>,
    pub link: String,
    /// 1.0 for structured APIs; lower for records extracted from prose.
    #[serde(default = "default_confidence")]
    pub extraction_confidence: f32,
}

fn default_confidence() -> f32 {
    0.5
}

impl UnifiedRecord {
    /// Business identity used to recognize the same procurement across
    /// sources. Prefers the official `{cnpj}:{edital}:{year}` triple; falls
    /// back to a content hash when either identifier is missing.
    pub fn dedup_key(&self) -> String {
        if !self.agency_cnpj.is_empty() {
            if let (Some(edital), Some(year)) = (&self.edital_number, self.fiscal_year) {
                let edital = edital.trim();
                if !edital.is_empty() {
                    return format!("{}:{}:{}", self.agency_cnpj, edital, year);
                }
            }
        }
        let value_int = self.estimated_value.unwrap_or(0.0) as i64;
        let text = key_text(&self.object_description);
        format!(
            "obj:{}",
            short_hash(&format!("{}:{}:{}", self.agency_cnpj, text, value_int))
        )
    }
}

/// Strip everything except digits, e.g. "12.345.678/0001-90" -> "12345678000190".
pub fn normalize_cnpj(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Text canonicalization for the fallback dedup key: lowercase, diacritics
/// folded, punctuation dropped, single spaces. Must stay stable: changing it
/// reshuffles every fallback key.
pub fn key_text(s: &str) -> String {
    let folded = crate::classify::fold_diacritics(&s.to_lowercase());
    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for ch in folded.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else {
            pending_space = true;
        }
    }
    out
}

/// First 16 hex chars of SHA-256. Collision-safe enough for cache keys and
/// fallback identities while staying log-friendly.
pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Caller-facing search parameters. Keywords default to the configured set
/// when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub states: Vec<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl SearchRequest {
    /// Cache fingerprint: canonical serialization of the parameters, hashed.
    /// Order of states/keywords does not matter.
    pub fn fingerprint(&self) -> String {
        let mut states: Vec<String> = self
            .states
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        states.sort();
        states.dedup();

        let mut keywords: Vec<String> = self
            .keywords
            .iter()
            .flatten()
            .map(|k| key_text(k))
            .filter(|k| !k.is_empty())
            .collect();
        keywords.sort();
        keywords.dedup();

        let canonical = format!(
            "v1|{}|{}|{}|{}|{}",
            self.date_from,
            self.date_to,
            states.join(","),
            keywords.join(","),
            self.max_pages.map(|p| p.to_string()).unwrap_or_default(),
        );
        short_hash(&canonical)
    }
}

/// Why a source contributed nothing to a search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: SourceName,
    pub reason: String,
}

/// Consolidated outcome of one search. Field semantics are stable for
/// downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub records: Vec<UnifiedRecord>,
    pub sources_attempted: usize,
    pub sources_succeeded: usize,
    pub sources_failed: Vec<SourceFailure>,
    /// Records fetched before classification.
    pub total_raw: usize,
    /// Records surviving classification, before dedup.
    pub total_filtered: usize,
    pub is_partial: bool,
    pub elapsed_ms: u64,
}
