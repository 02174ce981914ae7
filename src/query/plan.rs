//! Query planning.
//!
//! Turns raw user queries into MATCH expressions for the lexical index and
//! (optionally) the trigram table, plus supplementary typed WHERE clauses
//! that execution appends before grouping or paging.

use std::sync::Arc;

use crate::analyzer::Analyzer;
use crate::config::TrigramConfig;
use crate::error::{IndexError, Result};
use crate::query::trigram::trigram_set;

/// A typed parameter for a supplementary WHERE clause.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

/// A supplementary WHERE clause with positional parameters. The SQL
/// fragment references projection columns through the `d` alias.
#[derive(Debug, Clone)]
pub struct FilterClause {
    pub sql: String,
    pub params: Vec<FilterValue>,
}

impl FilterClause {
    pub fn mime_is(mime: &str) -> Self {
        Self {
            sql: "d.mime = ?".into(),
            params: vec![FilterValue::Text(mime.to_string())],
        }
    }

    pub fn author_is(author: &str) -> Self {
        Self {
            sql: "d.author = ?".into(),
            params: vec![FilterValue::Text(author.to_string())],
        }
    }

    pub fn modified_after(ts: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            sql: "d.modified_utc >= ?".into(),
            params: vec![FilterValue::Text(crate::model::format_utc(ts))],
        }
    }

    pub fn modified_before(ts: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            sql: "d.modified_utc < ?".into(),
            params: vec![FilterValue::Text(crate::model::format_utc(ts))],
        }
    }

    pub fn size_at_most(bytes: i64) -> Self {
        Self {
            sql: "d.size_bytes <= ?".into(),
            params: vec![FilterValue::Integer(bytes)],
        }
    }
}

/// An executable query: raw text, lexical MATCH, optional trigram MATCH,
/// filters, and whether the trigram fallback is required.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub raw_query: String,
    pub match_expr: String,
    pub trigram_expr: Option<String>,
    pub filters: Vec<FilterClause>,
    pub require_fuzzy: bool,
}

impl QueryPlan {
    pub fn with_filter(mut self, filter: FilterClause) -> Self {
        self.filters.push(filter);
        self
    }
}

pub struct QueryPlanner {
    analyzer: Arc<Analyzer>,
    trigram: TrigramConfig,
}

impl QueryPlanner {
    pub fn new(analyzer: Arc<Analyzer>, trigram: TrigramConfig) -> Self {
        Self { analyzer, trigram }
    }

    /// Lexical-only plan.
    pub fn plan(&self, query: &str) -> Result<QueryPlan> {
        self.build(query, false)
    }

    /// Hybrid plan with the trigram fallback required.
    pub fn plan_fuzzy(&self, query: &str) -> Result<QueryPlan> {
        self.build(query, true)
    }

    fn build(&self, query: &str, fuzzy: bool) -> Result<QueryPlan> {
        if query.trim().is_empty() {
            return Err(IndexError::InvalidArgument("query must not be empty".into()));
        }

        let tokens = self.analyzer.tokenize(query, None)?;
        if tokens.is_empty() {
            return Err(IndexError::InvalidArgument(
                "query contains no searchable tokens".into(),
            ));
        }

        let match_expr = tokens
            .iter()
            .map(|t| quote_match_token(t))
            .collect::<Vec<_>>()
            .join(" AND ");

        let trigram_expr = if fuzzy {
            self.trigram_expr(&tokens)
        } else {
            None
        };

        Ok(QueryPlan {
            raw_query: query.to_string(),
            match_expr,
            trigram_expr,
            filters: Vec::new(),
            require_fuzzy: fuzzy,
        })
    }

    /// OR-joined trigram MATCH over the normalized query tokens, capped at
    /// the configured term budget.
    fn trigram_expr(&self, tokens: &[String]) -> Option<String> {
        let joined = tokens.join(" ");
        let grams = trigram_set(&joined);
        if grams.is_empty() {
            return None;
        }
        let expr = grams
            .iter()
            .take(self.trigram.max_tokens)
            .map(|g| quote_match_token(g))
            .collect::<Vec<_>>()
            .join(" OR ");
        Some(expr)
    }
}

/// Quotes a term for FTS5 MATCH, doubling any embedded quotes.
pub(crate) fn quote_match_token(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;

    fn planner() -> QueryPlanner {
        let analyzer = Arc::new(Analyzer::from_config(&AnalyzerConfig::default()).unwrap());
        QueryPlanner::new(analyzer, TrigramConfig::default())
    }

    #[test]
    fn plan_quotes_and_joins_tokens() {
        let plan = planner().plan("Quarterly Report").unwrap();
        assert_eq!(plan.match_expr, "\"quarterly\" AND \"report\"");
        assert_eq!(plan.trigram_expr, None);
        assert!(!plan.require_fuzzy);
    }

    #[test]
    fn fuzzy_plan_carries_trigram_expr() {
        let plan = planner().plan_fuzzy("annual").unwrap();
        assert!(plan.require_fuzzy);
        let expr = plan.trigram_expr.unwrap();
        assert!(expr.contains("\"ann\""));
        assert!(expr.contains(" OR "));
    }

    #[test]
    fn empty_query_is_invalid() {
        let err = planner().plan("   ").unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));
    }

    #[test]
    fn punctuation_only_query_is_invalid() {
        let err = planner().plan("!!! ???").unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        assert_eq!(quote_match_token("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn filters_append() {
        let plan = planner()
            .plan("report")
            .unwrap()
            .with_filter(FilterClause::mime_is("text/plain"));
        assert_eq!(plan.filters.len(), 1);
        assert_eq!(plan.filters[0].sql, "d.mime = ?");
    }
}
