//! Lexical query execution and the hybrid search entry point.
//!
//! The lexical leg runs a MATCH against the FTS5 companion table with
//! BM25 column weights (title 4.0, mime 0.1, author 2.0, metadata text
//! 0.8, metadata JSON 0.2), orders by BM25 ascending with
//! modified/exact-title/title tiebreaks, pages with LIMIT/OFFSET after
//! candidate capping, and normalizes raw scores into `[0, 1]` via
//! `1 / (1 + max(0, raw))`.

use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::capability::FtsCapability;
use crate::db::ConnectionPool;
use crate::error::Result;
use crate::model::{HitSource, SearchHit};
use crate::query::merge::MergeStrategy;
use crate::query::plan::{FilterValue, QueryPlan, QueryPlanner};
use crate::query::trigram::TrigramSearch;
use tokio_util::sync::CancellationToken;

const BM25_WEIGHTS: &str = "4.0, 0.1, 2.0, 0.8, 0.2";

pub struct SearchQueryService {
    pool: Arc<ConnectionPool>,
    capability: Arc<FtsCapability>,
    planner: QueryPlanner,
    trigram: TrigramSearch,
    merger: MergeStrategy,
    candidate_cap: i64,
    snippet_tokens: i64,
}

impl SearchQueryService {
    pub fn new(
        pool: Arc<ConnectionPool>,
        capability: Arc<FtsCapability>,
        planner: QueryPlanner,
        trigram: TrigramSearch,
        merger: MergeStrategy,
        candidate_cap: i64,
        snippet_tokens: i64,
    ) -> Self {
        Self {
            pool,
            capability,
            planner,
            trigram,
            merger,
            candidate_cap,
            snippet_tokens,
        }
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    /// Lexical hits with normalized scores, paged.
    pub async fn search_with_scores(
        &self,
        plan: &QueryPlan,
        skip: i64,
        take: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        if cancel.is_cancelled() {
            return Err(crate::error::IndexError::Canceled);
        }
        if !self.capability.is_available() {
            debug!("full-text schema unavailable, lexical search returns nothing");
            return Ok(Vec::new());
        }
        let handle = self.pool.handle().await;
        self.fetch_lexical(&handle, plan, skip, take).await
    }

    /// Trigram hits with similarity scores, paged.
    pub async fn search_fuzzy_with_scores(
        &self,
        plan: &QueryPlan,
        skip: i64,
        take: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        if cancel.is_cancelled() {
            return Err(crate::error::IndexError::Canceled);
        }
        if !self.capability.is_available() {
            return Ok(Vec::new());
        }
        let handle = self.pool.handle().await;
        self.trigram.search(&handle, plan, skip, take).await
    }

    /// MATCH hit count; in hybrid mode the max of the lexical and fuzzy
    /// counts.
    pub async fn count(&self, plan: &QueryPlan, cancel: &CancellationToken) -> Result<i64> {
        if cancel.is_cancelled() {
            return Err(crate::error::IndexError::Canceled);
        }
        if !self.capability.is_available() {
            return Ok(0);
        }
        let handle = self.pool.handle().await;

        let sql = format!(
            "SELECT COUNT(*) \
             FROM search_document_fts \
             JOIN file_search_map m ON m.fts_rowid = search_document_fts.rowid \
             JOIN search_document d ON d.file_id = m.file_id \
             WHERE search_document_fts MATCH ?{}",
            filter_sql(plan)
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(&plan.match_expr);
        for filter in &plan.filters {
            for param in &filter.params {
                query = match param {
                    FilterValue::Text(v) => query.bind(v.clone()),
                    FilterValue::Integer(v) => query.bind(*v),
                    FilterValue::Real(v) => query.bind(*v),
                };
            }
        }
        let lexical: i64 = query.fetch_one(&handle).await?;

        if plan.require_fuzzy && plan.trigram_expr.is_some() {
            let fuzzy = self.trigram.count(&handle, plan).await?;
            return Ok(lexical.max(fuzzy));
        }
        Ok(lexical)
    }

    /// Hybrid search: lexical leg, trigram fallback when the plan requires
    /// it, merged by the configured strategy.
    pub async fn search(
        &self,
        plan: &QueryPlan,
        limit: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let take = limit.unwrap_or(self.candidate_cap).clamp(1, self.candidate_cap);

        let lexical = self.search_with_scores(plan, 0, take, cancel).await?;
        let fuzzy = if plan.require_fuzzy && plan.trigram_expr.is_some() {
            self.search_fuzzy_with_scores(plan, 0, take, cancel).await?
        } else {
            Vec::new()
        };

        Ok(self.merger.merge(lexical, fuzzy, take as usize))
    }

    async fn fetch_lexical(
        &self,
        handle: &SqlitePool,
        plan: &QueryPlan,
        skip: i64,
        take: i64,
    ) -> Result<Vec<SearchHit>> {
        let take = take.clamp(0, self.candidate_cap);
        let sql = format!(
            "SELECT m.file_id, d.title AS stored_title, d.mime, d.modified_utc, \
                    d.metadata_json AS stored_json, \
                    bm25(search_document_fts, {BM25_WEIGHTS}) AS rank, \
                    snippet(search_document_fts, 0, '[', ']', '…', {tokens}) AS snip_title, \
                    highlight(search_document_fts, 0, '[', ']') AS hl_title, \
                    snippet(search_document_fts, 2, '[', ']', '…', {tokens}) AS snip_author, \
                    snippet(search_document_fts, 3, '[', ']', '…', {tokens}) AS snip_meta, \
                    snippet(search_document_fts, 1, '[', ']', '…', {tokens}) AS snip_mime, \
                    highlight(search_document_fts, 4, '[', ']') AS hl_json \
             FROM search_document_fts \
             JOIN file_search_map m ON m.fts_rowid = search_document_fts.rowid \
             JOIN search_document d ON d.file_id = m.file_id \
             WHERE search_document_fts MATCH ?{filters} \
             ORDER BY rank ASC, d.modified_utc DESC, \
                      (lower(d.title) = lower(?)) DESC, d.title COLLATE NOCASE ASC \
             LIMIT ? OFFSET ?",
            tokens = self.snippet_tokens,
            filters = filter_sql(plan),
        );

        let mut query = sqlx::query(&sql).bind(&plan.match_expr);
        for filter in &plan.filters {
            for param in &filter.params {
                query = match param {
                    FilterValue::Text(v) => query.bind(v.clone()),
                    FilterValue::Integer(v) => query.bind(*v),
                    FilterValue::Real(v) => query.bind(*v),
                };
            }
        }
        query = query.bind(&plan.raw_query).bind(take).bind(skip.max(0));

        let rows = query.fetch_all(handle).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let file_id: String = row.get("file_id");
            let Ok(file_id) = uuid::Uuid::parse_str(&file_id) else {
                continue;
            };
            let stored_title: Option<String> = row.get("stored_title");
            let stored_title = stored_title.unwrap_or_default();
            let stored_json: Option<String> = row.get("stored_json");
            let raw_rank: f64 = row.get("rank");
            let modified_raw: String = row.get("modified_utc");
            let modified_utc =
                crate::model::parse_utc(&modified_raw).unwrap_or_else(chrono::Utc::now);

            let snippet = pick_snippet(
                row.get("snip_title"),
                row.get("hl_title"),
                row.get("snip_author"),
                row.get("snip_meta"),
                row.get("snip_mime"),
                row.get("hl_json"),
                &stored_title,
                stored_json.as_deref(),
            );

            hits.push(SearchHit {
                file_id,
                title: stored_title.clone(),
                mime: row.get("mime"),
                score: normalize_score(raw_rank),
                snippet,
                modified_utc,
                exact_title_match: stored_title.eq_ignore_ascii_case(&plan.raw_query),
                source: HitSource::Lexical,
            });
        }
        Ok(hits)
    }
}

fn filter_sql(plan: &QueryPlan) -> String {
    let mut out = String::new();
    for filter in &plan.filters {
        out.push_str(" AND ");
        out.push_str(&filter.sql);
    }
    out
}

/// `1 / (1 + max(0, raw))`. FTS5 reports matches as non-positive ranks, so
/// genuine matches land at 1.0 and only degenerate positive ranks (very
/// common terms) decay below it.
fn normalize_score(raw: f64) -> f64 {
    1.0 / (1.0 + raw.max(0.0))
}

/// First non-empty among title, author, metadata text, mime and metadata
/// JSON, preferring spans that carry a `[bracket]` highlight, with the
/// stored title as final fallback.
#[allow(clippy::too_many_arguments)]
fn pick_snippet(
    snip_title: Option<String>,
    hl_title: Option<String>,
    snip_author: Option<String>,
    snip_meta: Option<String>,
    snip_mime: Option<String>,
    hl_json: Option<String>,
    stored_title: &str,
    stored_json: Option<&str>,
) -> String {
    let has_highlight = |s: &Option<String>| {
        s.as_deref()
            .map(|v| v.contains('[') && v.contains(']'))
            .unwrap_or(false)
    };

    if has_highlight(&snip_title) {
        return snip_title.unwrap();
    }
    if has_highlight(&hl_title) {
        return hl_title.unwrap();
    }
    if has_highlight(&snip_author) {
        return snip_author.unwrap();
    }
    if has_highlight(&snip_meta) {
        return snip_meta.unwrap();
    }
    if has_highlight(&snip_mime) {
        return snip_mime.unwrap();
    }
    if has_highlight(&hl_json) {
        return summarize_json_snippet(&hl_json.unwrap(), stored_json);
    }

    for candidate in [snip_title, snip_author, snip_meta] {
        if let Some(value) = candidate {
            if !value.trim().is_empty() {
                return value;
            }
        }
    }
    stored_title.to_string()
}

/// Lifts `[highlighted]` tokens out of a raw JSON highlight and projects
/// them onto a readable summary of the metadata object.
fn summarize_json_snippet(highlighted: &str, stored_json: Option<&str>) -> String {
    let tokens = extract_highlighted_tokens(highlighted);

    let Some(parsed) = stored_json
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|v| v.as_object().cloned())
    else {
        return highlighted.to_string();
    };

    let mut parts = Vec::new();
    for (key, value) in &parsed {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        parts.push(format!("{key}: {rendered}"));
    }
    let mut summary = parts.join("; ");

    for token in tokens {
        if let Some(pos) = summary.to_lowercase().find(&token.to_lowercase()) {
            let end = pos + token.len();
            if summary.is_char_boundary(pos) && summary.is_char_boundary(end) {
                summary = format!("{}[{}]{}", &summary[..pos], &summary[pos..end], &summary[end..]);
                break;
            }
        }
    }
    summary
}

fn extract_highlighted_tokens(highlighted: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = highlighted;
    while let Some(start) = rest.find('[') {
        let after = &rest[start + 1..];
        let Some(end) = after.find(']') else { break };
        let token = &after[..end];
        if !token.is_empty() {
            tokens.push(token.to_string());
        }
        rest = &after[end + 1..];
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_score_maps_matches_to_unit() {
        assert!((normalize_score(-3.2) - 1.0).abs() < 1e-9);
        assert!((normalize_score(0.0) - 1.0).abs() < 1e-9);
        assert!((normalize_score(1.0) - 0.5).abs() < 1e-9);
        assert!(normalize_score(9.0) < normalize_score(1.0));
    }

    #[test]
    fn snippet_prefers_highlighted_title() {
        let snippet = pick_snippet(
            Some("[annual] report".into()),
            Some("[annual] report full".into()),
            Some("jane doe".into()),
            None,
            None,
            None,
            "annual report",
            None,
        );
        assert_eq!(snippet, "[annual] report");
    }

    #[test]
    fn snippet_falls_through_to_author() {
        let snippet = pick_snippet(
            Some("annual report".into()),
            Some("annual report".into()),
            Some("[jane] doe".into()),
            None,
            None,
            None,
            "annual report",
            None,
        );
        assert_eq!(snippet, "[jane] doe");
    }

    #[test]
    fn snippet_falls_back_to_stored_title() {
        let snippet = pick_snippet(None, None, None, None, None, None, "annual report", None);
        assert_eq!(snippet, "annual report");
    }

    #[test]
    fn json_snippet_is_summarized() {
        let snippet = pick_snippet(
            None,
            None,
            None,
            None,
            None,
            Some("{\"project\":\"[apollo]\"}".into()),
            "status report",
            Some("{\"project\":\"apollo\",\"phase\":\"3\"}"),
        );
        assert!(snippet.contains("[apollo]"), "snippet was {snippet}");
        assert!(snippet.contains("phase"));
    }

    #[test]
    fn extracts_multiple_highlight_tokens() {
        let tokens = extract_highlighted_tokens("a [b] c [d]");
        assert_eq!(tokens, vec!["b", "d"]);
    }
}
