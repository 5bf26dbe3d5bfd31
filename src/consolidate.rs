// src/consolidate.rs
//! Cross-source consolidation. Groups records by dedup key and keeps one
//! survivor per procurement, chosen by source priority. Pure and
//! order-independent: shuffling the input never changes the output set.

use std::collections::HashMap;

use metrics::counter;
use tracing::debug;

use crate::model::{SourceName, UnifiedRecord};

/// Jaro-Winkler floor below which a fallback-key merge looks suspicious.
const SIMILARITY_FLOOR: f64 = 0.85;

/// Merge `records` down to one entry per dedup key. The survivor is the
/// record whose source has the lowest priority number; exact priority ties
/// fall back to `(source_name, source_id)` so the result does not depend on
/// arrival order.
pub fn consolidate(
    records: Vec<UnifiedRecord>,
    priorities: &HashMap<SourceName, u8>,
) -> Vec<UnifiedRecord> {
    let mut by_key: HashMap<String, UnifiedRecord> = HashMap::with_capacity(records.len());
    let mut merged = 0u64;

    for record in records {
        let key = record.dedup_key();
        match by_key.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                merged += 1;
                similarity_check(slot.key(), slot.get(), &record);
                if rank(&record, priorities) < rank(slot.get(), priorities) {
                    slot.insert(record);
                }
            }
        }
    }

    if merged > 0 {
        counter!("records_merged_total").increment(merged);
    }
    by_key.into_values().collect()
}

/// Ordering key: priority first, then a stable tie-break. Unknown sources
/// sort last so a misconfigured registry cannot shadow configured ones.
fn rank<'r>(record: &'r UnifiedRecord, priorities: &HashMap<SourceName, u8>) -> (u8, &'static str, &'r str) {
    let priority = priorities.get(&record.source_name).copied().unwrap_or(u8::MAX);
    (priority, record.source_name.code(), &record.source_id)
}

/// Fallback-key collisions between dissimilar descriptions hint at a false
/// merge; log them so the key heuristic can be tuned against real data.
fn similarity_check(key: &str, kept: &UnifiedRecord, incoming: &UnifiedRecord) {
    if !key.starts_with("obj:") {
        return;
    }
    let similarity = strsim::jaro_winkler(&kept.object_description, &incoming.object_description);
    if similarity < SIMILARITY_FLOOR {
        debug!(
            target: "consolidate",
            key,
            similarity,
            kept_source = %kept.source_name,
            incoming_source = %incoming.source_name,
            "fallback-key merge with dissimilar descriptions"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(source: SourceName, id: &str, cnpj: &str, edital: &str, year: i32) -> UnifiedRecord {
        UnifiedRecord {
            source_id: id.into(),
            source_name: source,
            object_description: "Aquisição de merenda escolar".into(),
            estimated_value: Some(1000.0),
            agency_cnpj: cnpj.into(),
            agency_name: String::new(),
            state_code: "SP".into(),
            municipality: String::new(),
            publication_date: NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
            opening_date: None,
            edital_number: Some(edital.into()),
            fiscal_year: Some(year),
            link: String::new(),
            extraction_confidence: 1.0,
        }
    }

    fn priorities() -> HashMap<SourceName, u8> {
        crate::sources::SourceRegistry::default_seed().priorities()
    }

    #[test]
    fn same_procurement_across_sources_keeps_lowest_priority() {
        let a = record(SourceName::Comprasnet, "c-1", "12345678000190", "45/2025", 2025);
        let b = record(SourceName::Pncp, "p-1", "12345678000190", "45/2025", 2025);
        let c = record(SourceName::Dou, "d-1", "12345678000190", "45/2025", 2025);

        let out = consolidate(vec![a, b, c], &priorities());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source_name, SourceName::Pncp, "priority 1 wins");
    }

    #[test]
    fn reordering_input_does_not_change_output() {
        let records = vec![
            record(SourceName::Dou, "d-1", "111", "1/2025", 2025),
            record(SourceName::Pncp, "p-1", "111", "1/2025", 2025),
            record(SourceName::Comprasnet, "c-1", "222", "2/2025", 2025),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        let sort_key = |r: &UnifiedRecord| (r.dedup_key(), r.source_name, r.source_id.clone());
        let mut out_a = consolidate(records, &priorities());
        let mut out_b = consolidate(reversed, &priorities());
        out_a.sort_by_key(sort_key);
        out_b.sort_by_key(sort_key);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn consolidate_is_idempotent() {
        let records = vec![
            record(SourceName::Pncp, "p-1", "111", "1/2025", 2025),
            record(SourceName::Comprasnet, "c-1", "111", "1/2025", 2025),
            record(SourceName::Pncp, "p-2", "333", "3/2025", 2025),
        ];
        let prios = priorities();
        let once = consolidate(records, &prios);
        let mut twice = consolidate(once.clone(), &prios);
        let mut once_sorted = once;
        let sort_key = |r: &UnifiedRecord| r.dedup_key();
        once_sorted.sort_by_key(sort_key);
        twice.sort_by_key(sort_key);
        assert_eq!(once_sorted, twice);
    }

    #[test]
    fn distinct_keys_all_survive() {
        let records = vec![
            record(SourceName::Pncp, "p-1", "111", "1/2025", 2025),
            record(SourceName::Pncp, "p-2", "111", "2/2025", 2025),
            record(SourceName::Pncp, "p-3", "111", "1/2025", 2024),
        ];
        assert_eq!(consolidate(records, &priorities()).len(), 3);
    }

    #[test]
    fn equal_priority_tie_breaks_deterministically() {
        let mut prios = HashMap::new();
        prios.insert(SourceName::Pncp, 1);
        prios.insert(SourceName::Comprasnet, 1);

        let a = record(SourceName::Comprasnet, "c-1", "111", "1/2025", 2025);
        let b = record(SourceName::Pncp, "p-1", "111", "1/2025", 2025);

        let out_ab = consolidate(vec![a.clone(), b.clone()], &prios);
        let out_ba = consolidate(vec![b, a], &prios);
        assert_eq!(out_ab[0].source_name, out_ba[0].source_name);
        // "comprasnet" < "pncp" lexicographically.
        assert_eq!(out_ab[0].source_name, SourceName::Comprasnet);
    }

    #[test]
    fn fallback_key_merges_identifierless_duplicates() {
        let mut a = record(SourceName::Pncp, "p-1", "111", "x", 2025);
        a.edital_number = None;
        let mut b = record(SourceName::Dou, "d-1", "111", "x", 2025);
        b.edital_number = None;
        b.fiscal_year = None;

        let out = consolidate(vec![a, b], &priorities());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source_name, SourceName::Pncp);
    }
}
