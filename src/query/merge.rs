//! Hybrid result merging.
//!
//! The lexical and fuzzy legs score in different spaces, so the merge
//! scales fuzzy scores before folding them in. Three strategies ship and
//! are selected at construction: lexical-only (fuzzy discarded),
//! weighted-average (fixed fuzzy weight, default 0.85) and median-scaled
//! (fuzzy scaled by the median lexical score, falling back to 0.6 when the
//! lexical set is empty).

use std::collections::HashMap;

use crate::config::{MergeConfig, MergeStrategyKind};
use crate::model::{FileId, SearchHit};

#[derive(Debug, Clone, Copy)]
pub enum MergeStrategy {
    LexicalOnly,
    WeightedAverage { fuzzy_weight: f64 },
    MedianScaled { fallback: f64 },
}

impl MergeStrategy {
    pub fn from_config(config: &MergeConfig) -> Self {
        match config.strategy {
            MergeStrategyKind::LexicalOnly => MergeStrategy::LexicalOnly,
            MergeStrategyKind::WeightedAverage => MergeStrategy::WeightedAverage {
                fuzzy_weight: config.fuzzy_weight,
            },
            MergeStrategyKind::MedianScaled => MergeStrategy::MedianScaled {
                fallback: config.median_fallback,
            },
        }
    }

    /// Merges pre-sorted lexical and fuzzy hits and returns the top `take`.
    pub fn merge(&self, lexical: Vec<SearchHit>, fuzzy: Vec<SearchHit>, take: usize) -> Vec<SearchHit> {
        let fuzzy = match self {
            MergeStrategy::LexicalOnly => Vec::new(),
            _ => fuzzy,
        };
        let scale = self.fuzzy_scale(&lexical);

        let mut order: Vec<FileId> = Vec::new();
        let mut by_id: HashMap<FileId, SearchHit> = HashMap::new();
        for hit in lexical {
            order.push(hit.file_id);
            by_id.insert(hit.file_id, hit);
        }

        for mut hit in fuzzy {
            hit.score *= scale;
            match by_id.get_mut(&hit.file_id) {
                Some(existing) => {
                    // The lexical snippet wins while it carries a real
                    // highlight; otherwise the fuzzy span is better than
                    // nothing.
                    if !existing.has_highlight() && hit.has_highlight() {
                        existing.snippet = hit.snippet;
                        existing.title = hit.title;
                    }
                    existing.score = existing.score.max(hit.score);
                    existing.exact_title_match |= hit.exact_title_match;
                }
                None => {
                    order.push(hit.file_id);
                    by_id.insert(hit.file_id, hit);
                }
            }
        }

        let mut merged: Vec<SearchHit> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();

        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.has_highlight().cmp(&a.has_highlight()))
                .then_with(|| b.modified_utc.cmp(&a.modified_utc))
                .then_with(|| b.exact_title_match.cmp(&a.exact_title_match))
                .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        merged.truncate(take);
        merged
    }

    fn fuzzy_scale(&self, lexical: &[SearchHit]) -> f64 {
        match self {
            MergeStrategy::LexicalOnly => 0.0,
            MergeStrategy::WeightedAverage { fuzzy_weight } => *fuzzy_weight,
            MergeStrategy::MedianScaled { fallback } => {
                median(lexical.iter().map(|h| h.score)).unwrap_or(*fallback)
            }
        }
    }
}

fn median(scores: impl Iterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = scores.collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HitSource;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn hit(id: u128, score: f64, snippet: &str, source: HitSource) -> SearchHit {
        SearchHit {
            file_id: Uuid::from_u128(id),
            title: format!("doc {id}"),
            mime: "text/plain".into(),
            score,
            snippet: snippet.to_string(),
            modified_utc: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            exact_title_match: false,
            source,
        }
    }

    #[test]
    fn lexical_only_discards_fuzzy() {
        let strategy = MergeStrategy::LexicalOnly;
        let merged = strategy.merge(
            vec![hit(1, 0.9, "[doc] one", HitSource::Lexical)],
            vec![hit(2, 0.8, "[doc] two", HitSource::Trigram)],
            10,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].file_id, Uuid::from_u128(1));
    }

    #[test]
    fn weighted_average_scales_fuzzy() {
        let strategy = MergeStrategy::WeightedAverage { fuzzy_weight: 0.85 };
        let merged = strategy.merge(
            vec![hit(1, 0.5, "[doc] one", HitSource::Lexical)],
            vec![hit(2, 1.0, "[doc] two", HitSource::Trigram)],
            10,
        );
        assert_eq!(merged.len(), 2);
        // 1.0 * 0.85 outranks 0.5.
        assert_eq!(merged[0].file_id, Uuid::from_u128(2));
        assert!((merged[0].score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn median_scale_uses_lexical_median() {
        let strategy = MergeStrategy::MedianScaled { fallback: 0.6 };
        let lexical = vec![
            hit(1, 1.0, "[a]", HitSource::Lexical),
            hit(2, 0.5, "[b]", HitSource::Lexical),
            hit(3, 0.2, "[c]", HitSource::Lexical),
        ];
        let merged = strategy.merge(lexical, vec![hit(4, 1.0, "[d]", HitSource::Trigram)], 10);
        let fuzzy = merged
            .iter()
            .find(|h| h.file_id == Uuid::from_u128(4))
            .unwrap();
        assert!((fuzzy.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn median_scale_falls_back_when_lexical_empty() {
        let strategy = MergeStrategy::MedianScaled { fallback: 0.6 };
        let merged = strategy.merge(Vec::new(), vec![hit(4, 1.0, "[d]", HitSource::Trigram)], 10);
        assert!((merged[0].score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn duplicate_keeps_highlighted_lexical_snippet_and_max_score() {
        let strategy = MergeStrategy::WeightedAverage { fuzzy_weight: 1.0 };
        let merged = strategy.merge(
            vec![hit(1, 0.4, "[annual] report", HitSource::Lexical)],
            vec![hit(1, 0.9, "annual report", HitSource::Trigram)],
            10,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].snippet, "[annual] report");
        assert!((merged[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn duplicate_takes_fuzzy_snippet_when_lexical_has_no_highlight() {
        let strategy = MergeStrategy::WeightedAverage { fuzzy_weight: 1.0 };
        let merged = strategy.merge(
            vec![hit(1, 0.4, "annual report", HitSource::Lexical)],
            vec![hit(1, 0.2, "[annual] report", HitSource::Trigram)],
            10,
        );
        assert_eq!(merged[0].snippet, "[annual] report");
    }

    #[test]
    fn merge_is_monotonic_in_lexical_additions() {
        // Adding a lexical result only evicts entries with strictly lower
        // scores than the new top-k minimum.
        let strategy = MergeStrategy::WeightedAverage { fuzzy_weight: 1.0 };
        let fuzzy = vec![
            hit(10, 0.7, "[x]", HitSource::Trigram),
            hit(11, 0.5, "[y]", HitSource::Trigram),
        ];
        let before = strategy.merge(vec![hit(1, 0.6, "[a]", HitSource::Lexical)], fuzzy.clone(), 2);
        let after = strategy.merge(
            vec![
                hit(1, 0.6, "[a]", HitSource::Lexical),
                hit(2, 0.9, "[b]", HitSource::Lexical),
            ],
            fuzzy,
            2,
        );

        let min_after = after.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
        for hit in &before {
            let survived = after.iter().any(|h| h.file_id == hit.file_id);
            if !survived {
                assert!(hit.score < min_after, "evicted {} had score >= new minimum", hit.file_id);
            }
        }
    }

    #[test]
    fn ties_break_on_highlight_then_title() {
        let strategy = MergeStrategy::WeightedAverage { fuzzy_weight: 1.0 };
        let mut plain = hit(1, 0.5, "no highlight", HitSource::Lexical);
        plain.title = "beta".into();
        let mut highlighted = hit(2, 0.5, "[with] highlight", HitSource::Lexical);
        highlighted.title = "alpha".into();

        let merged = strategy.merge(vec![plain, highlighted], Vec::new(), 10);
        assert_eq!(merged[0].file_id, Uuid::from_u128(2));
    }
}
