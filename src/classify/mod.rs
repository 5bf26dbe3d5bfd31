// src/classify/mod.rs
//! Relevance gate for procurement records: text normalization, keyword and
//! exclusion matching with word-boundary semantics, and escalation of
//! ambiguous records to the LLM arbiter.

pub mod arbiter;

use std::path::PathBuf;
use std::sync::Arc;

use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classify::arbiter::{ArbiterMode, LlmArbiter};
use crate::model::UnifiedRecord;

pub const DEFAULT_KEYWORDS_CONFIG_PATH: &str = "config/keywords.toml";
pub const ENV_KEYWORDS_CONFIG_PATH: &str = "KEYWORDS_CONFIG_PATH";

/// Records below this extraction confidence get their keyword verdict
/// double-checked by the arbiter.
const LOW_CONFIDENCE: f32 = 0.5;

/// Where an inclusion/exclusion decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Keyword,
    LlmStandard,
    LlmConservative,
    LlmZeroMatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub included: bool,
    pub matched_keywords: Vec<String>,
    pub source: ClassificationSource,
    /// Present when the arbiter produced the verdict.
    pub confidence: Option<f32>,
}

impl Classification {
    fn keyword(included: bool, matched: Vec<String>) -> Self {
        Self {
            included,
            matched_keywords: matched,
            source: ClassificationSource::Keyword,
            confidence: None,
        }
    }
}

/* ----------------------------
Text normalization
---------------------------- */

/// Fold Portuguese (and general Latin-1) diacritics to ASCII so keyword
/// matching survives the inconsistent accenting of gazette text.
pub fn fold_diacritics(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'ç' => 'c',
            'Ç' => 'C',
            'ñ' => 'n',
            'Ñ' => 'N',
            other => other,
        })
        .collect()
}

/// Normalize text for matching: HTML entities decoded, tags stripped,
/// diacritics folded, lowercased, punctuation collapsed to single spaces.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Fold accents, lowercase
    out = fold_diacritics(&out).to_lowercase();

    // 4) Punctuation to spaces (keep word chars, digits, slashes for edital numbers)
    out = out
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '/' {
                c
            } else {
                ' '
            }
        })
        .collect();

    // 5) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 6) Length cap: 2000 chars
    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }

    out
}

/* ----------------------------
Config schema (from TOML)
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl KeywordConfig {
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct Root {
            keywords: KeywordConfig,
        }
        let root: Root = toml::from_str(toml_str)?;
        anyhow::ensure!(
            !root.keywords.include.is_empty(),
            "keywords config has no include phrases"
        );
        Ok(root.keywords)
    }

    /// Load using env var + fallbacks; built-in seed when nothing is on disk.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(p) = std::env::var(ENV_KEYWORDS_CONFIG_PATH) {
            let content = std::fs::read_to_string(PathBuf::from(&p))?;
            return Self::from_toml_str(&content);
        }
        let default = PathBuf::from(DEFAULT_KEYWORDS_CONFIG_PATH);
        if default.exists() {
            let content = std::fs::read_to_string(&default)?;
            return Self::from_toml_str(&content);
        }
        Ok(Self::default_seed())
    }

    /// Terms that show up in the tenders our users actually care about.
    pub fn default_seed() -> Self {
        Self {
            include: [
                "merenda escolar",
                "generos alimenticios",
                "material escolar",
                "equipamentos de informatica",
                "material hospitalar",
                "medicamentos",
                "obras de pavimentacao",
                "construcao civil",
                "transporte escolar",
                "limpeza urbana",
                "coleta de residuos",
                "manutencao predial",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclude: [
                "leilao de veiculos",
                "alienacao de bens",
                "concurso publico",
                "processo seletivo",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/* ----------------------------
Compiled matcher
---------------------------- */

/// Keyword phrases compiled to word-boundary regexes over normalized text.
/// Multi-word phrases match as phrases, not as bags of words.
pub struct KeywordMatcher {
    includes: Vec<(String, Regex)>,
    excludes: Vec<(String, Regex)>,
}

fn phrase_regex(phrase: &str) -> Option<Regex> {
    let normalized = normalize_text(phrase);
    if normalized.is_empty() {
        return None;
    }
    let escaped: Vec<String> = normalized
        .split_whitespace()
        .map(regex::escape)
        .collect();
    let pattern = format!(r"\b{}\b", escaped.join(r"\s+"));
    Regex::new(&pattern).ok()
}

impl KeywordMatcher {
    pub fn from_phrases(include: &[String], exclude: &[String]) -> Self {
        let compile = |phrases: &[String]| {
            phrases
                .iter()
                .filter_map(|p| phrase_regex(p).map(|re| (p.clone(), re)))
                .collect::<Vec<_>>()
        };
        Self {
            includes: compile(include),
            excludes: compile(exclude),
        }
    }

    /// Exclusion phrases present in the normalized text.
    pub fn excluded_by(&self, normalized: &str) -> Option<&str> {
        self.excludes
            .iter()
            .find(|(_, re)| re.is_match(normalized))
            .map(|(phrase, _)| phrase.as_str())
    }

    /// All matching include phrases.
    pub fn matches(&self, normalized: &str) -> Vec<String> {
        self.includes
            .iter()
            .filter(|(_, re)| re.is_match(normalized))
            .map(|(phrase, _)| phrase.clone())
            .collect()
    }
}

/* ----------------------------
Filter
---------------------------- */

pub struct ClassificationFilter {
    default_matcher: Arc<KeywordMatcher>,
    default_excludes: Vec<String>,
    arbiter: Arc<LlmArbiter>,
    mode: ArbiterMode,
}

impl ClassificationFilter {
    pub fn new(cfg: &KeywordConfig, arbiter: Arc<LlmArbiter>, mode: ArbiterMode) -> Self {
        Self {
            default_matcher: Arc::new(KeywordMatcher::from_phrases(&cfg.include, &cfg.exclude)),
            default_excludes: cfg.exclude.clone(),
            arbiter,
            mode,
        }
    }

    /// Matcher for one search: the configured set, or a per-request keyword
    /// override combined with the configured exclusions.
    pub fn matcher_for(&self, override_keywords: Option<&[String]>) -> Arc<KeywordMatcher> {
        match override_keywords {
            Some(kw) if !kw.is_empty() => Arc::new(KeywordMatcher::from_phrases(
                kw,
                &self.default_excludes,
            )),
            _ => self.default_matcher.clone(),
        }
    }

    /// Full classification of one record. Zero-keyword records are not
    /// discarded outright; the arbiter gets the final word, failing closed.
    pub async fn classify(
        &self,
        matcher: &KeywordMatcher,
        record: &UnifiedRecord,
    ) -> Classification {
        let normalized = normalize_text(&record.object_description);

        if let Some(phrase) = matcher.excluded_by(&normalized) {
            counter!("records_excluded_total", "reason" => "exclusion").increment(1);
            return Classification::keyword(false, vec![phrase.to_string()]);
        }

        let matched = matcher.matches(&normalized);
        if !matched.is_empty() {
            // Keyword hit on shaky extraction: let the arbiter confirm. Its
            // failure keeps the keyword verdict; keyword evidence stands.
            if record.extraction_confidence < LOW_CONFIDENCE {
                match self.arbiter.judge(&record.object_description).await {
                    Ok(v) => {
                        let threshold = self.mode.threshold();
                        let included = v.relevant && v.confidence >= threshold;
                        return Classification {
                            included,
                            matched_keywords: matched,
                            source: match self.mode {
                                ArbiterMode::Standard => ClassificationSource::LlmStandard,
                                ArbiterMode::Conservative => {
                                    ClassificationSource::LlmConservative
                                }
                            },
                            confidence: Some(v.confidence),
                        };
                    }
                    Err(e) => {
                        warn!(
                            target: "classify",
                            error = %e,
                            "arbiter confirmation failed; keeping keyword verdict"
                        );
                        return Classification::keyword(true, matched);
                    }
                }
            }
            return Classification::keyword(true, matched);
        }

        // Zero keyword matches: arbitrate. Any arbiter failure excludes the
        // record (fail closed), it never silently includes.
        match self.arbiter.judge(&record.object_description).await {
            Ok(v) => {
                let included = v.relevant && v.confidence >= self.mode.threshold();
                Classification {
                    included,
                    matched_keywords: Vec::new(),
                    source: ClassificationSource::LlmZeroMatch,
                    confidence: Some(v.confidence),
                }
            }
            Err(e) => {
                warn!(
                    target: "classify",
                    error = %e,
                    "zero-match arbitration failed; excluding record"
                );
                counter!("arbiter_failures_total").increment(1);
                Classification {
                    included: false,
                    matched_keywords: Vec::new(),
                    source: ClassificationSource::LlmZeroMatch,
                    confidence: None,
                }
            }
        }
    }
}

/* ----------------------------
Tests
---------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::arbiter::{ArbiterVerdict, LlmArbiter, MockArbiter};
    use crate::model::SourceName;
    use chrono::NaiveDate;

    fn record(description: &str, confidence: f32) -> UnifiedRecord {
        UnifiedRecord {
            source_id: "t-1".into(),
            source_name: SourceName::Pncp,
            object_description: description.into(),
            estimated_value: None,
            agency_cnpj: "123".into(),
            agency_name: String::new(),
            state_code: "SP".into(),
            municipality: String::new(),
            publication_date: NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
            opening_date: None,
            edital_number: None,
            fiscal_year: None,
            link: String::new(),
            extraction_confidence: confidence,
        }
    }

    fn filter_with(arbiter: MockArbiter, mode: ArbiterMode) -> ClassificationFilter {
        ClassificationFilter::new(
            &KeywordConfig::default_seed(),
            Arc::new(LlmArbiter::for_tests(arbiter)),
            mode,
        )
    }

    #[test]
    fn normalize_folds_accents_and_strips_markup() {
        let s = "Aquisi&ccedil;&atilde;o de <b>GÊNEROS</b>   alimentícios!!";
        assert_eq!(normalize_text(s), "aquisicao de generos alimenticios");
    }

    #[test]
    fn phrases_match_with_word_boundaries_not_substrings() {
        let m = KeywordMatcher::from_phrases(&["obras".into()], &[]);
        assert!(m.matches("contratacao de obras publicas").len() == 1);
        // "obrastec" must not match "obras".
        assert!(m.matches("fornecedor obrastec ltda").is_empty());
    }

    #[test]
    fn multi_word_phrases_match_as_phrases() {
        let m = KeywordMatcher::from_phrases(&["merenda escolar".into()], &[]);
        assert!(!m.matches("aquisicao de merenda escolar municipal").is_empty());
        // Words present but apart: no phrase match.
        assert!(m
            .matches("merenda para rede escolar")
            .is_empty());
    }

    #[tokio::test]
    async fn exclusion_wins_over_keywords() {
        let f = filter_with(MockArbiter::approving(0.9), ArbiterMode::Standard);
        let r = record(
            "Leilão de veículos e equipamentos de informática",
            1.0,
        );
        let c = f.classify(&f.matcher_for(None), &r).await;
        assert!(!c.included);
        assert_eq!(c.source, ClassificationSource::Keyword);
    }

    #[tokio::test]
    async fn keyword_match_includes_without_arbiter() {
        let f = filter_with(MockArbiter::failing(), ArbiterMode::Standard);
        let r = record("Aquisição de merenda escolar", 1.0);
        let c = f.classify(&f.matcher_for(None), &r).await;
        assert!(c.included);
        assert_eq!(c.source, ClassificationSource::Keyword);
        assert_eq!(c.matched_keywords, vec!["merenda escolar".to_string()]);
    }

    #[tokio::test]
    async fn zero_match_arbiter_yes_includes_with_tag() {
        let f = filter_with(MockArbiter::approving(0.8), ArbiterMode::Standard);
        let r = record("Fornecimento de alimentação para unidades de ensino", 1.0);
        let c = f.classify(&f.matcher_for(None), &r).await;
        assert!(c.included);
        assert_eq!(c.source, ClassificationSource::LlmZeroMatch);
        assert_eq!(c.confidence, Some(0.8));
    }

    #[tokio::test]
    async fn zero_match_arbiter_failure_fails_closed() {
        let f = filter_with(MockArbiter::failing(), ArbiterMode::Standard);
        let r = record("Fornecimento de alimentação para unidades de ensino", 1.0);
        let c = f.classify(&f.matcher_for(None), &r).await;
        assert!(!c.included, "arbiter failure must exclude");
        assert_eq!(c.source, ClassificationSource::LlmZeroMatch);
    }

    #[tokio::test]
    async fn conservative_mode_raises_the_bar() {
        let f = filter_with(MockArbiter::approving(0.7), ArbiterMode::Conservative);
        let r = record("Fornecimento de alimentação para unidades de ensino", 1.0);
        let c = f.classify(&f.matcher_for(None), &r).await;
        assert!(!c.included, "0.7 < conservative threshold 0.8");
    }

    #[tokio::test]
    async fn low_confidence_record_is_confirmed_by_arbiter() {
        let f = filter_with(
            MockArbiter::with_verdict(ArbiterVerdict {
                relevant: false,
                confidence: 0.9,
            }),
            ArbiterMode::Standard,
        );
        // Keyword hit, but the record came from noisy prose extraction.
        let r = record("aquisicao de medicamentos conforme anexo", 0.3);
        let c = f.classify(&f.matcher_for(None), &r).await;
        assert!(!c.included, "arbiter overruled the noisy keyword hit");
        assert_eq!(c.source, ClassificationSource::LlmStandard);
    }

    #[tokio::test]
    async fn low_confidence_arbiter_failure_keeps_keyword_verdict() {
        let f = filter_with(MockArbiter::failing(), ArbiterMode::Standard);
        let r = record("aquisicao de medicamentos conforme anexo", 0.3);
        let c = f.classify(&f.matcher_for(None), &r).await;
        assert!(c.included, "keyword evidence stands when arbiter is down");
        assert_eq!(c.source, ClassificationSource::Keyword);
    }

    #[tokio::test]
    async fn override_keywords_replace_default_set() {
        let f = filter_with(MockArbiter::failing(), ArbiterMode::Standard);
        let matcher = f.matcher_for(Some(&["vigilancia patrimonial".to_string()]));
        let r = record("Contratação de vigilância patrimonial armada", 1.0);
        let c = f.classify(&matcher, &r).await;
        assert!(c.included);
        // The default exclusions still apply with overridden keywords.
        let excluded = record("Vigilância patrimonial e leilão de veículos", 1.0);
        let c2 = f.classify(&matcher, &excluded).await;
        assert!(!c2.included);
    }
}
