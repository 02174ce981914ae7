//! Query planning, execution and merging.
//!
//! A [`plan::QueryPlan`] bundles the raw query text, the lexical MATCH
//! expression, an optional trigram expression and supplementary WHERE
//! clauses. [`lexical::SearchQueryService`] executes the lexical leg with
//! BM25 weighting and drives the hybrid merge; [`trigram`] provides the
//! typo-tolerant fallback; [`merge`] holds the pluggable merge strategies;
//! [`facets`] and [`suggest`] cover aggregations and autocomplete.

pub mod facets;
pub mod lexical;
pub mod merge;
pub mod plan;
pub mod suggest;
pub mod trigram;
