//! Facet aggregations over the projection.
//!
//! Three facet families: term facets (top 20 values of a column), date
//! histograms (day/week/month buckets over the modified timestamp) and
//! fixed numeric size ranges (0–10 MB, 10–100 MB, >100 MB). Supplementary
//! filters are applied before grouping.

use std::sync::Arc;

use sqlx::{Row, SqlitePool};

use crate::db::ConnectionPool;
use crate::error::Result;
use crate::query::plan::{FilterClause, FilterValue};

const TERM_FACET_LIMIT: i64 = 20;

const MB: i64 = 1024 * 1024;

/// Column a term facet groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermFacetField {
    Mime,
    Author,
}

impl TermFacetField {
    fn column(&self) -> &'static str {
        match self {
            TermFacetField::Mime => "mime",
            TermFacetField::Author => "author",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateInterval {
    Day,
    Week,
    Month,
}

impl DateInterval {
    fn strftime(&self) -> &'static str {
        match self {
            DateInterval::Day => "%Y-%m-%d",
            DateInterval::Week => "%Y-W%W",
            DateInterval::Month => "%Y-%m",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetBucket {
    pub key: String,
    pub count: i64,
}

pub struct FacetService {
    pool: Arc<ConnectionPool>,
}

impl FacetService {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Top 20 values of the given column, count descending.
    pub async fn term_facet(
        &self,
        field: TermFacetField,
        filters: &[FilterClause],
    ) -> Result<Vec<FacetBucket>> {
        let handle = self.pool.handle().await;
        let column = field.column();
        let sql = format!(
            "SELECT d.{column} AS key, COUNT(*) AS n \
             FROM search_document d \
             WHERE d.{column} IS NOT NULL{} \
             GROUP BY d.{column} \
             ORDER BY n DESC, key ASC \
             LIMIT {TERM_FACET_LIMIT}",
            filter_sql(filters)
        );
        self.fetch_buckets(&handle, &sql, filters).await
    }

    /// Counts per day/week/month bucket of the modified timestamp.
    pub async fn date_histogram(
        &self,
        interval: DateInterval,
        filters: &[FilterClause],
    ) -> Result<Vec<FacetBucket>> {
        let handle = self.pool.handle().await;
        let fmt = interval.strftime();
        let sql = format!(
            "SELECT strftime('{fmt}', d.modified_utc) AS key, COUNT(*) AS n \
             FROM search_document d \
             WHERE 1 = 1{} \
             GROUP BY key \
             ORDER BY key ASC",
            filter_sql(filters)
        );
        self.fetch_buckets(&handle, &sql, filters).await
    }

    /// Fixed size buckets: 0–10 MB, 10–100 MB, >100 MB.
    pub async fn size_ranges(&self, filters: &[FilterClause]) -> Result<Vec<FacetBucket>> {
        let handle = self.pool.handle().await;
        let sql = format!(
            "SELECT CASE \
               WHEN d.size_bytes < {small} THEN '0-10MB' \
               WHEN d.size_bytes < {large} THEN '10-100MB' \
               ELSE '>100MB' \
             END AS key, COUNT(*) AS n \
             FROM search_document d \
             WHERE 1 = 1{} \
             GROUP BY key \
             ORDER BY MIN(d.size_bytes) ASC",
            filter_sql(filters),
            small = 10 * MB,
            large = 100 * MB,
        );
        self.fetch_buckets(&handle, &sql, filters).await
    }

    async fn fetch_buckets(
        &self,
        handle: &SqlitePool,
        sql: &str,
        filters: &[FilterClause],
    ) -> Result<Vec<FacetBucket>> {
        let mut query = sqlx::query(sql);
        for filter in filters {
            for param in &filter.params {
                query = match param {
                    FilterValue::Text(v) => query.bind(v.clone()),
                    FilterValue::Integer(v) => query.bind(*v),
                    FilterValue::Real(v) => query.bind(*v),
                };
            }
        }
        let rows = query.fetch_all(handle).await?;
        Ok(rows
            .iter()
            .map(|row| FacetBucket {
                key: row.get::<Option<String>, _>("key").unwrap_or_default(),
                count: row.get("n"),
            })
            .collect())
    }
}

fn filter_sql(filters: &[FilterClause]) -> String {
    let mut out = String::new();
    for filter in filters {
        out.push_str(" AND ");
        out.push_str(&filter.sql);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_formats() {
        assert_eq!(DateInterval::Day.strftime(), "%Y-%m-%d");
        assert_eq!(DateInterval::Week.strftime(), "%Y-W%W");
        assert_eq!(DateInterval::Month.strftime(), "%Y-%m");
    }

    #[test]
    fn term_field_columns() {
        assert_eq!(TermFacetField::Mime.column(), "mime");
        assert_eq!(TermFacetField::Author.column(), "author");
    }
}
