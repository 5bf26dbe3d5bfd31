// src/sources/providers/extract.rs
//! Field extraction from gazette prose. The structured portals hand us typed
//! JSON; the gazette feeds hand us paragraphs. These helpers pull the
//! identifiers out of the text and score how much of the record was actually
//! found, which becomes `extraction_confidence`.

use once_cell::sync::OnceCell;
use regex::Regex;

fn re_cnpj() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(r"\b\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}\b").expect("cnpj regex")
    })
}

fn re_edital() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        // "Edital nº 45/2025", "EDITAL DE LICITAÇÃO N. 12/2024", "Pregão Eletrônico nº 90021/2025"
        Regex::new(
            r"(?i)\b(?:edital|preg[ãa]o(?:\s+eletr[ôo]nico)?|concorr[êe]ncia|tomada\s+de\s+pre[çc]os)\s*(?:de\s+licita[çc][ãa]o\s*)?n?[ºo°.]*\s*(\d{1,6}/\d{4})",
        )
        .expect("edital regex")
    })
}

fn re_money() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        // "R$ 1.234.567,89": thousands dots, decimal comma.
        Regex::new(r"R\$\s*([\d.]+),(\d{2})").expect("money regex")
    })
}

fn re_uf() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(AC|AL|AP|AM|BA|CE|DF|ES|GO|MA|MT|MS|MG|PA|PB|PR|PE|PI|RJ|RN|RS|RO|RR|SC|SP|SE|TO)\b",
        )
        .expect("uf regex")
    })
}

/// First CNPJ in the text, digits only.
pub fn cnpj_in(text: &str) -> Option<String> {
    re_cnpj()
        .find(text)
        .map(|m| crate::model::normalize_cnpj(m.as_str()))
}

/// First edital/pregão number in "NNN/YYYY" form.
pub fn edital_number_in(text: &str) -> Option<String> {
    re_edital()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Fiscal year from an "NNN/YYYY" edital number.
pub fn fiscal_year_of(edital: &str) -> Option<i32> {
    edital.rsplit('/').next().and_then(|y| y.parse().ok())
}

/// Largest "R$ ..." amount in the text. Gazette entries often quote several
/// figures; the estimated value is normally the largest.
pub fn money_value_in(text: &str) -> Option<f64> {
    let mut best: Option<f64> = None;
    for caps in re_money().captures_iter(text) {
        let whole = caps.get(1)?.as_str().replace('.', "");
        let cents = caps.get(2)?.as_str();
        if let Ok(v) = format!("{whole}.{cents}").parse::<f64>() {
            best = Some(best.map_or(v, |b: f64| b.max(v)));
        }
    }
    best
}

/// First UF code mentioned in the text.
pub fn uf_in(text: &str) -> Option<String> {
    re_uf().find(text).map(|m| m.as_str().to_string())
}

/// Confidence scoring for prose-derived records: start from the source's
/// floor and credit each identifier actually found. Capped below 1.0 so
/// extracted records never outrank structured ones in reviews.
pub fn confidence(
    base: f32,
    cnpj: &Option<String>,
    edital: &Option<String>,
    value: &Option<f64>,
) -> f32 {
    let mut c = base;
    if cnpj.is_some() {
        c += 0.2;
    }
    if edital.is_some() {
        c += 0.2;
    }
    if value.is_some() {
        c += 0.1;
    }
    c.min(0.9)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "AVISO DE LICITAÇÃO. Pregão Eletrônico nº 45/2025. \
        A Prefeitura Municipal de Sorocaba-SP, CNPJ 12.345.678/0001-90, torna público \
        que realizará licitação para aquisição de merenda escolar, valor estimado \
        R$ 1.234.567,89, com abertura em 10/06/2025.";

    #[test]
    fn extracts_cnpj_digits_only() {
        assert_eq!(cnpj_in(SAMPLE).as_deref(), Some("12345678000190"));
        assert_eq!(cnpj_in("sem cnpj aqui"), None);
    }

    #[test]
    fn extracts_edital_number_and_year() {
        let edital = edital_number_in(SAMPLE).unwrap();
        assert_eq!(edital, "45/2025");
        assert_eq!(fiscal_year_of(&edital), Some(2025));
    }

    #[test]
    fn extracts_largest_money_value() {
        assert_eq!(money_value_in(SAMPLE), Some(1_234_567.89));
        let multi = "garantia de R$ 10.000,00 e valor estimado R$ 250.000,00";
        assert_eq!(money_value_in(multi), Some(250_000.00));
        assert_eq!(money_value_in("nada"), None);
    }

    #[test]
    fn extracts_uf() {
        assert_eq!(uf_in(SAMPLE).as_deref(), Some("SP"));
    }

    #[test]
    fn confidence_grows_with_found_fields_and_caps() {
        let none = confidence(0.3, &None, &None, &None);
        assert!((none - 0.3).abs() < 1e-6);
        let all = confidence(
            0.5,
            &Some("1".into()),
            &Some("45/2025".into()),
            &Some(1.0),
        );
        assert!((all - 0.9).abs() < 1e-6, "capped at 0.9, got {all}");
    }
}
