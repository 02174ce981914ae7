//! Trigram fuzzy retrieval.
//!
//! Candidates come from an OR-joined trigram MATCH against the `file_trgm`
//! table, then a Jaccard post-filter decides what survives: the query's
//! trigram set is compared token-by-token against the candidate's
//! searchable text (whole-field comparison included, best similarity
//! wins), so a one-word typo is not diluted by the rest of the document.
//! Hits are ordered by similarity descending, then file id, and carry
//! manual snippet/highlight spans computed from the normalized title.

use std::collections::BTreeSet;
use std::sync::Arc;

use sqlx::{Row, SqlitePool};

use crate::analyzer::Analyzer;
use crate::config::TrigramConfig;
use crate::error::Result;
use crate::model::{HitSource, SearchHit};
use crate::query::plan::{FilterValue, QueryPlan};

/// Overlapping 3-grams per whitespace-separated token of already-normalized
/// text. Tokens shorter than three characters contribute themselves.
pub fn trigram_set(text: &str) -> BTreeSet<String> {
    let mut grams = BTreeSet::new();
    for token in text.split_whitespace() {
        let chars: Vec<char> = token.chars().filter(|c| c.is_alphanumeric()).collect();
        if chars.is_empty() {
            continue;
        }
        if chars.len() < 3 {
            grams.insert(chars.iter().collect());
        } else {
            for window in chars.windows(3) {
                grams.insert(window.iter().collect());
            }
        }
    }
    grams
}

/// Jaccard similarity of two trigram sets; 0.0 when either is empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

pub struct TrigramSearch {
    analyzer: Arc<Analyzer>,
    config: TrigramConfig,
    candidate_cap: i64,
}

struct FuzzyCandidate {
    hit: SearchHit,
    similarity: f64,
}

impl TrigramSearch {
    pub fn new(analyzer: Arc<Analyzer>, config: TrigramConfig, candidate_cap: i64) -> Self {
        Self {
            analyzer,
            config,
            candidate_cap,
        }
    }

    /// Executes the plan's trigram leg. Empty when the plan has no trigram
    /// expression.
    pub async fn search(
        &self,
        pool: &SqlitePool,
        plan: &QueryPlan,
        skip: i64,
        take: i64,
    ) -> Result<Vec<SearchHit>> {
        let mut candidates = self.candidates(pool, plan).await?;
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.hit.file_id.cmp(&b.hit.file_id))
        });
        Ok(candidates
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(take.max(0) as usize)
            .map(|c| c.hit)
            .collect())
    }

    /// Number of candidates surviving the similarity floor.
    pub async fn count(&self, pool: &SqlitePool, plan: &QueryPlan) -> Result<i64> {
        Ok(self.candidates(pool, plan).await?.len() as i64)
    }

    async fn candidates(&self, pool: &SqlitePool, plan: &QueryPlan) -> Result<Vec<FuzzyCandidate>> {
        let Some(trigram_expr) = plan.trigram_expr.as_deref() else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT m.file_id, d.title, d.author, d.metadata_text, d.mime, d.modified_utc, \
                    file_trgm.trgm \
             FROM file_trgm \
             JOIN file_trgm_map m ON m.fts_rowid = file_trgm.rowid \
             JOIN search_document d ON d.file_id = m.file_id \
             WHERE file_trgm MATCH ?",
        );
        for filter in &plan.filters {
            sql.push_str(" AND ");
            sql.push_str(&filter.sql);
        }
        sql.push_str(" LIMIT ?");

        let mut query = sqlx::query(&sql).bind(trigram_expr);
        for filter in &plan.filters {
            for param in &filter.params {
                query = match param {
                    FilterValue::Text(v) => query.bind(v.clone()),
                    FilterValue::Integer(v) => query.bind(*v),
                    FilterValue::Real(v) => query.bind(*v),
                };
            }
        }
        query = query.bind(self.candidate_cap);

        let rows = query.fetch_all(pool).await?;

        let normalized_query = self.analyzer.normalize(&plan.raw_query);
        let query_grams = trigram_set(&normalized_query);
        let query_tokens: Vec<&str> = normalized_query.split_whitespace().collect();

        let mut candidates = Vec::new();
        for row in &rows {
            let title: Option<String> = row.get("title");
            let title = title.unwrap_or_default();
            let author: Option<String> = row.get("author");
            let metadata_text: Option<String> = row.get("metadata_text");

            let mut searchable = title.clone();
            if let Some(author) = &author {
                searchable.push(' ');
                searchable.push_str(author);
            }
            if let Some(metadata_text) = &metadata_text {
                searchable.push(' ');
                searchable.push_str(metadata_text);
            }

            // Token-level Jaccard: the best-matching word decides, with the
            // stored gram set as a floor for matches outside the selected
            // columns (e.g. filename-only trigram fields).
            let stored: String = row.get("trgm");
            let stored_grams: BTreeSet<String> =
                stored.split_whitespace().map(String::from).collect();
            let mut similarity = jaccard(&query_grams, &trigram_set(&searchable));
            for word in searchable.split_whitespace() {
                similarity = similarity.max(jaccard(&query_grams, &trigram_set(word)));
            }
            similarity = similarity.max(jaccard(&query_grams, &stored_grams));
            if similarity < self.config.min_similarity {
                continue;
            }

            let file_id: String = row.get("file_id");
            let Ok(file_id) = uuid::Uuid::parse_str(&file_id) else {
                continue;
            };
            let modified_raw: String = row.get("modified_utc");
            let modified_utc =
                crate::model::parse_utc(&modified_raw).unwrap_or_else(chrono::Utc::now);

            let snippet = bracket_best_match(&title, &query_tokens);
            let exact_title_match = title == normalized_query;

            candidates.push(FuzzyCandidate {
                hit: SearchHit {
                    file_id,
                    title: title.clone(),
                    mime: row.get("mime"),
                    score: similarity,
                    snippet,
                    modified_utc,
                    exact_title_match,
                    source: HitSource::Trigram,
                },
                similarity,
            });
        }
        Ok(candidates)
    }
}

/// Brackets the title word most similar to any query token. Titles are
/// already normalized, so plain word comparison is enough.
fn bracket_best_match(title: &str, query_tokens: &[&str]) -> String {
    let mut best: Option<(usize, f64)> = None;
    let words: Vec<&str> = title.split_whitespace().collect();

    for (idx, word) in words.iter().enumerate() {
        let word_grams = trigram_set(word);
        for token in query_tokens {
            let token_grams = trigram_set(token);
            let similarity = jaccard(&word_grams, &token_grams);
            if similarity > 0.0 && best.map(|(_, s)| similarity > s).unwrap_or(true) {
                best = Some((idx, similarity));
            }
        }
    }

    match best {
        Some((idx, _)) => words
            .iter()
            .enumerate()
            .map(|(i, w)| {
                if i == idx {
                    format!("[{w}]")
                } else {
                    (*w).to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        None => title.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigram_set_windows_tokens() {
        let grams = trigram_set("annual report");
        assert!(grams.contains("ann"));
        assert!(grams.contains("nnu"));
        assert!(grams.contains("rep"));
        assert!(grams.contains("ort"));
        assert!(!grams.contains("lre"));
    }

    #[test]
    fn short_tokens_contribute_themselves() {
        let grams = trigram_set("ab c");
        assert!(grams.contains("ab"));
        assert!(grams.contains("c"));
    }

    #[test]
    fn jaccard_of_typo_is_positive() {
        let a = trigram_set("annual");
        let b = trigram_set("anual");
        let sim = jaccard(&a, &b);
        assert!(sim > 0.25, "similarity was {sim}");
        assert!(sim < 1.0);
    }

    #[test]
    fn jaccard_identity_is_one() {
        let a = trigram_set("report");
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn jaccard_empty_is_zero() {
        let a = trigram_set("report");
        let empty = BTreeSet::new();
        assert_eq!(jaccard(&a, &empty), 0.0);
        assert_eq!(jaccard(&empty, &empty), 0.0);
    }

    #[test]
    fn bracket_marks_closest_word() {
        let snippet = bracket_best_match("annual report", &["anual"]);
        assert_eq!(snippet, "[annual] report");
    }

    #[test]
    fn bracket_leaves_unrelated_title_alone() {
        let snippet = bracket_best_match("quarterly summary", &["zzzz"]);
        assert_eq!(snippet, "quarterly summary");
    }
}
