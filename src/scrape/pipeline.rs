//! Record pipeline: drop rules, keep rules, per-scrape cap, dedup.
//!
//! Stages run in that fixed order over the record stream of one unit,
//! preserving source order throughout.

use crate::config::{
    DropRule, FingerprintMode, FingerprintStoreConfig, KeepRule, MatchPredicate, MatchType,
    SourceConfig,
};
use crate::extract;
use crate::fingerprint;
use crate::store::{ScrapeStore, StoreError};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    /// Records entering the dedup stage.
    pub total: u64,
    /// Records suppressed by an unexpired fingerprint.
    pub hits: u64,
    /// Records inserted as new fingerprints (or passed through when dedup is
    /// disabled).
    pub misses: u64,
    /// Surplus records discarded by the per-scrape cap.
    pub dropped_by_cap: u64,
}

impl PipelineStats {
    pub fn merge(&mut self, other: &PipelineStats) {
        self.total += other.total;
        self.hits += other.hits;
        self.misses += other.misses;
        self.dropped_by_cap += other.dropped_by_cap;
    }
}

pub struct RecordPipeline {
    store: Arc<dyn ScrapeStore>,
    store_cfg: FingerprintStoreConfig,
}

impl RecordPipeline {
    pub fn new(store: Arc<dyn ScrapeStore>, store_cfg: FingerprintStoreConfig) -> Self {
        Self { store, store_cfg }
    }

    /// Run all stages for the records of one unit.
    pub async fn run(
        &self,
        records: Vec<Value>,
        source: &SourceConfig,
    ) -> Result<(Vec<Value>, PipelineStats), StoreError> {
        let mut stats = PipelineStats::default();

        let filtered = apply_filters(records, &source.filters.drop, &source.filters.keep);

        let mut limited = filtered;
        if let Some(limit) = source.filters.limits.max_records_per_scrape {
            if limited.len() > limit {
                stats.dropped_by_cap = (limited.len() - limit) as u64;
                limited.truncate(limit);
            }
        }

        stats.total = limited.len() as u64;
        if !source.delta_detection.enabled {
            stats.misses = stats.total;
            return Ok((limited, stats));
        }

        let dd = &source.delta_detection;
        let ttl = dd.ttl_seconds.unwrap_or(self.store_cfg.default_ttl_seconds);
        let keys = match dd.fingerprint_mode {
            FingerprintMode::Keys => dd.fingerprint_keys.as_deref(),
            FingerprintMode::FullRecord => None,
        };

        let mut kept = Vec::with_capacity(limited.len());
        let mut fresh_digests: Vec<Vec<u8>> = Vec::new();
        let mut batch_seen: HashSet<Vec<u8>> = HashSet::new();
        for record in limited {
            let digest = match keys {
                Some(keys) => fingerprint::digest_keys(&source.name, &record, keys),
                None => fingerprint::digest_full_record(&source.name, &record),
            };
            if batch_seen.contains(&digest) || self.store.seen(&source.name, &digest).await? {
                stats.hits += 1;
                continue;
            }
            stats.misses += 1;
            batch_seen.insert(digest.clone());
            fresh_digests.push(digest);
            kept.push(record);
        }

        self.store
            .insert_many(&source.name, &fresh_digests, ttl)
            .await?;
        let cap = dd
            .max_entries
            .unwrap_or(self.store_cfg.max_entries_per_source);
        self.store.enforce_cap(&source.name, cap).await?;

        Ok((kept, stats))
    }
}

fn apply_filters(records: Vec<Value>, drop: &[DropRule], keep: &[KeepRule]) -> Vec<Value> {
    if drop.is_empty() && keep.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| {
            let dropped = drop
                .iter()
                .any(|rule| rule.any.iter().any(|p| record_matches(record, p)));
            if dropped {
                return false;
            }
            if keep.is_empty() {
                return true;
            }
            keep.iter()
                .any(|rule| rule.all.iter().all(|p| record_matches(record, p)))
        })
        .collect()
}

fn record_matches(record: &Value, predicate: &MatchPredicate) -> bool {
    let candidate = extract::lookup(record, None, &predicate.field);
    predicate_matches(predicate.match_type, candidate, &predicate.value)
}

/// Evaluate one predicate. Comparison coerces numeric equality when both
/// sides parse as numbers; otherwise compares string renderings. Regex
/// patterns are anchored at both ends unless they contain `.*`. An absent
/// candidate matches only `not_equals`.
pub fn predicate_matches(match_type: MatchType, candidate: Option<&Value>, expected: &Value) -> bool {
    match match_type {
        MatchType::Equals => candidate.is_some_and(|c| values_equal(c, expected)),
        MatchType::NotEquals => !candidate.is_some_and(|c| values_equal(c, expected)),
        MatchType::In => {
            let Some(candidate) = candidate else {
                return false;
            };
            match expected {
                Value::Array(options) => options.iter().any(|o| values_equal(candidate, o)),
                single => values_equal(candidate, single),
            }
        }
        MatchType::Regex => {
            let (Some(candidate), Some(pattern)) = (candidate, expected.as_str()) else {
                return false;
            };
            let Ok(regex) = compile_predicate_regex(pattern) else {
                return false;
            };
            regex.is_match(&render(candidate))
        }
    }
}

fn compile_predicate_regex(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.contains(".*") {
        Regex::new(pattern)
    } else {
        Regex::new(&format!("^(?:{})$", pattern))
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    render(a) == render(b)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Quote-free rendering used for string comparison and regex matching.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
