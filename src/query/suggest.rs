//! Autocomplete and spell suggestions.
//!
//! Suggestions are harvested from documents at index time with per-field
//! weights (title 5, author 3, filename 2, metadata 1); duplicate
//! (term, language, source) rows sum their weights on upsert and
//! retraction subtracts the same amounts, deleting rows that reach zero.
//! Prefix lookup is an escaped case-insensitive LIKE ordered by weight
//! descending then term. Spell suggestions run trigram Jaccard similarity
//! against a per-language dictionary cached in memory.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use sqlx::SqliteConnection;
use tokio::sync::Mutex;

use crate::analyzer::Analyzer;
use crate::db::ConnectionPool;
use crate::error::Result;
use crate::model::FileDocument;
use crate::query::trigram::{jaccard, trigram_set};

const WEIGHT_TITLE: f64 = 5.0;
const WEIGHT_AUTHOR: f64 = 3.0;
const WEIGHT_FILENAME: f64 = 2.0;
const WEIGHT_METADATA: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Suggestion {
    pub term: String,
    pub weight: f64,
    pub lang: String,
    pub source_field: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpellSuggestion {
    pub term: String,
    pub score: f64,
}

pub struct SuggestionService {
    pool: Arc<ConnectionPool>,
    analyzer: Arc<Analyzer>,
}

impl SuggestionService {
    pub fn new(pool: Arc<ConnectionPool>, analyzer: Arc<Analyzer>) -> Self {
        Self { pool, analyzer }
    }

    /// Adds the document's terms to the suggestion store. Runs on the
    /// caller's connection so it can join the indexing transaction.
    pub async fn harvest(
        &self,
        conn: &mut SqliteConnection,
        file: &FileDocument,
        lang: &str,
    ) -> Result<()> {
        for (term, field, weight) in self.harvest_terms(file) {
            sqlx::query(
                "INSERT INTO suggestions (term, weight, lang, source_field) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(term, lang, source_field) \
                 DO UPDATE SET weight = weight + excluded.weight",
            )
            .bind(&term)
            .bind(weight)
            .bind(lang)
            .bind(field)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Subtracts the weights [`harvest`](Self::harvest) added for this
    /// document and deletes rows that drop to zero or below.
    pub async fn retract(
        &self,
        conn: &mut SqliteConnection,
        file: &FileDocument,
        lang: &str,
    ) -> Result<()> {
        for (term, field, weight) in self.harvest_terms(file) {
            sqlx::query(
                "UPDATE suggestions SET weight = weight - ? \
                 WHERE term = ? AND lang = ? AND source_field = ?",
            )
            .bind(weight)
            .bind(&term)
            .bind(lang)
            .bind(field)
            .execute(&mut *conn)
            .await?;
        }
        sqlx::query("DELETE FROM suggestions WHERE weight <= 0")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Case-insensitive prefix lookup, weight descending then term.
    pub async fn suggest(&self, prefix: &str, lang: &str, limit: i64) -> Result<Vec<Suggestion>> {
        let normalized = self.analyzer.normalize(prefix);
        let pattern = format!("{}%", escape_like(normalized.trim()));
        let handle = self.pool.handle().await;
        Ok(sqlx::query_as::<_, Suggestion>(
            "SELECT term, weight, lang, source_field FROM suggestions \
             WHERE term LIKE ? ESCAPE '\\' AND lang = ? \
             ORDER BY weight DESC, term ASC \
             LIMIT ?",
        )
        .bind(pattern)
        .bind(lang)
        .bind(limit)
        .fetch_all(&handle)
        .await?)
    }

    /// Aggregated (term, source field, weight) triples for a document.
    fn harvest_terms(&self, file: &FileDocument) -> Vec<(String, &'static str, f64)> {
        let mut totals: HashMap<(String, &'static str), f64> = HashMap::new();

        let mut add = |text: &str, field: &'static str, base: f64| {
            for token in self.analyzer.tokenize_default(text) {
                *totals.entry((token, field)).or_insert(0.0) += base;
            }
        };

        add(&file.title, "title", WEIGHT_TITLE);
        if let Some(author) = &file.author {
            add(author, "author", WEIGHT_AUTHOR);
        }
        add(&file.name, "filename", WEIGHT_FILENAME);
        if let Some(metadata) = &file.metadata_text {
            add(metadata, "metadata", WEIGHT_METADATA);
        }

        let mut terms: Vec<(String, &'static str, f64)> = totals
            .into_iter()
            .map(|((term, field), weight)| (term, field, weight))
            .collect();
        terms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        terms
    }
}

/// Escapes LIKE metacharacters with backslash.
fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

type Dictionary = Arc<Vec<(String, BTreeSet<String>)>>;

pub struct SpellSuggestionService {
    pool: Arc<ConnectionPool>,
    analyzer: Arc<Analyzer>,
    threshold: f64,
    cache: Mutex<HashMap<String, Dictionary>>,
}

impl SpellSuggestionService {
    pub fn new(pool: Arc<ConnectionPool>, analyzer: Arc<Analyzer>, threshold: f64) -> Self {
        Self {
            pool,
            analyzer,
            threshold,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Terms above the similarity threshold, score descending then
    /// dictionary ordinal.
    pub async fn suggest(&self, term: &str, lang: &str, limit: usize) -> Result<Vec<SpellSuggestion>> {
        let normalized = self.analyzer.normalize(term);
        let query_grams = trigram_set(&normalized);
        if query_grams.is_empty() {
            return Ok(Vec::new());
        }

        let dictionary = self.dictionary(lang).await?;
        let mut scored: Vec<(usize, SpellSuggestion)> = dictionary
            .iter()
            .enumerate()
            .filter_map(|(ordinal, (candidate, grams))| {
                let score = jaccard(&query_grams, grams);
                (score >= self.threshold).then(|| {
                    (
                        ordinal,
                        SpellSuggestion {
                            term: candidate.clone(),
                            score,
                        },
                    )
                })
            })
            .collect();

        scored.sort_by(|(ord_a, a), (ord_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ord_a.cmp(ord_b))
        });
        Ok(scored.into_iter().take(limit).map(|(_, s)| s).collect())
    }

    /// Drops the cached dictionary for a language; the next lookup reloads.
    pub async fn invalidate(&self, lang: &str) {
        self.cache.lock().await.remove(lang);
    }

    async fn dictionary(&self, lang: &str) -> Result<Dictionary> {
        {
            let cache = self.cache.lock().await;
            if let Some(dictionary) = cache.get(lang) {
                return Ok(Arc::clone(dictionary));
            }
        }

        let handle = self.pool.handle().await;
        let terms: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT term FROM suggestions WHERE lang = ? ORDER BY term ASC",
        )
        .bind(lang)
        .fetch_all(&handle)
        .await?;

        let dictionary: Dictionary = Arc::new(
            terms
                .into_iter()
                .map(|term| {
                    let grams = trigram_set(&term);
                    (term, grams)
                })
                .collect(),
        );
        self.cache
            .lock()
            .await
            .insert(lang.to_string(), Arc::clone(&dictionary));
        Ok(dictionary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_escaping_handles_metacharacters() {
        assert_eq!(escape_like("100%_done\\"), "100\\%\\_done\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }
}
