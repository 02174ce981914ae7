//! Configuration parsing and validation.
//!
//! The search core is configured via a TOML file. The config defines the
//! database path, connection-pool sizing, analyzer profiles, indexing mode,
//! reindex-processor cadence, trigram fields, projection busy-retry and the
//! hybrid merge strategy.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
    #[serde(default)]
    pub trigram: TrigramConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_max_pool_size() -> u32 {
    64
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// How file mutations reach the projection.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IndexingMode {
    /// Projection committed alongside the aggregate change.
    SameTransaction,
    /// Aggregate change alone; a reindex-queue entry is written instead.
    Deferred,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_indexing_mode")]
    pub mode: IndexingMode,
    /// Files above this size have extractor metadata text ignored.
    #[serde(default)]
    pub max_content_bytes: Option<u64>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            mode: default_indexing_mode(),
            max_content_bytes: None,
        }
    }
}

fn default_indexing_mode() -> IndexingMode {
    IndexingMode::SameTransaction
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReindexConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_iteration_timeout_secs")]
    pub iteration_timeout_secs: u64,
    #[serde(default = "default_error_backoff_base_secs")]
    pub error_backoff_base_secs: u64,
    #[serde(default = "default_max_retries_per_entry")]
    pub max_retries_per_entry: i64,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            iteration_timeout_secs: default_iteration_timeout_secs(),
            error_backoff_base_secs: default_error_backoff_base_secs(),
            max_retries_per_entry: default_max_retries_per_entry(),
        }
    }
}

impl ReindexConfig {
    /// Poll interval with the 5-second floor applied.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(5))
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn error_backoff_base(&self) -> Duration {
        Duration::from_secs(self.error_backoff_base_secs)
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_poll_interval_secs() -> u64 {
    15
}
fn default_iteration_timeout_secs() -> u64 {
    120
}
fn default_error_backoff_base_secs() -> u64 {
    30
}
fn default_max_retries_per_entry() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    #[serde(default = "default_profile_name")]
    pub default_profile: String,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            default_profile: default_profile_name(),
            profiles: HashMap::new(),
        }
    }
}

fn default_profile_name() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfileConfig {
    #[serde(default)]
    pub enable_stemming: bool,
    #[serde(default = "default_true")]
    pub keep_numbers: bool,
    #[serde(default)]
    pub stopwords: Vec<String>,
    #[serde(default = "default_true")]
    pub split_filenames: bool,
    /// Snowball language used when stemming is enabled.
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            enable_stemming: false,
            keep_numbers: true,
            stopwords: Vec::new(),
            split_filenames: true,
            language: default_language(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_language() -> String {
    "english".to_string()
}

/// Projection fields folded into the trigram table.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrigramField {
    Title,
    Author,
    Filename,
    MetadataText,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrigramConfig {
    /// Cap on trigram terms folded into a single MATCH expression.
    #[serde(default = "default_trigram_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_trigram_fields")]
    pub fields: Vec<TrigramField>,
    /// Jaccard similarity floor for fuzzy candidates.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

impl Default for TrigramConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_trigram_max_tokens(),
            fields: default_trigram_fields(),
            min_similarity: default_min_similarity(),
        }
    }
}

fn default_trigram_max_tokens() -> usize {
    64
}
fn default_trigram_fields() -> Vec<TrigramField> {
    vec![TrigramField::Title, TrigramField::Filename]
}
fn default_min_similarity() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given zero-based attempt: 25, 50, 100,
    /// 200, 400 ms with the defaults.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    25
}
fn default_retry_max_ms() -> u64 {
    400
}

/// Hybrid merge strategy selection.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategyKind {
    LexicalOnly,
    WeightedAverage,
    MedianScaled,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MergeConfig {
    #[serde(default = "default_merge_strategy")]
    pub strategy: MergeStrategyKind,
    /// Fuzzy score weight for the weighted-average strategy.
    #[serde(default = "default_fuzzy_weight")]
    pub fuzzy_weight: f64,
    /// Fuzzy scale when the lexical result set is empty (median-scaled).
    #[serde(default = "default_median_fallback")]
    pub median_fallback: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: default_merge_strategy(),
            fuzzy_weight: default_fuzzy_weight(),
            median_fallback: default_median_fallback(),
        }
    }
}

fn default_merge_strategy() -> MergeStrategyKind {
    MergeStrategyKind::MedianScaled
}
fn default_fuzzy_weight() -> f64 {
    0.85
}
fn default_median_fallback() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Candidate cap applied before LIMIT/OFFSET paging.
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: i64,
    /// Token budget passed to the FTS5 snippet() function.
    #[serde(default = "default_snippet_tokens")]
    pub snippet_tokens: i64,
    /// Spell-suggestion similarity floor.
    #[serde(default = "default_spell_threshold")]
    pub spell_threshold: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            candidate_cap: default_candidate_cap(),
            snippet_tokens: default_snippet_tokens(),
            spell_threshold: default_spell_threshold(),
        }
    }
}

fn default_candidate_cap() -> i64 {
    256
}
fn default_snippet_tokens() -> i64 {
    12
}
fn default_spell_threshold() -> f64 {
    0.4
}

impl Config {
    /// In-memory configuration rooted at the given database path. Used by
    /// embedders that do not carry a config file.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            pool: PoolConfig::default(),
            analyzer: AnalyzerConfig::default(),
            indexing: IndexingConfig::default(),
            reindex: ReindexConfig::default(),
            trigram: TrigramConfig::default(),
            retry: RetryConfig::default(),
            merge: MergeConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pool.max_pool_size == 0 {
        anyhow::bail!("pool.max_pool_size must be > 0");
    }
    if config.reindex.batch_size == 0 {
        anyhow::bail!("reindex.batch_size must be > 0");
    }
    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be > 0");
    }
    if !(0.0..=1.0).contains(&config.merge.fuzzy_weight) {
        anyhow::bail!("merge.fuzzy_weight must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.merge.median_fallback) {
        anyhow::bail!("merge.median_fallback must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.trigram.min_similarity) {
        anyhow::bail!("trigram.min_similarity must be in [0.0, 1.0]");
    }
    if config.trigram.fields.is_empty() {
        anyhow::bail!("trigram.fields must name at least one field");
    }
    if config.query.candidate_cap < 1 {
        anyhow::bail!("query.candidate_cap must be >= 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_profile() {
        let config = Config::with_db_path("/tmp/docdex.sqlite");
        assert_eq!(config.pool.max_pool_size, 64);
        assert_eq!(config.reindex.batch_size, 32);
        assert_eq!(config.reindex.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.reindex.iteration_timeout(), Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.merge.strategy, MergeStrategyKind::MedianScaled);
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let reindex = ReindexConfig {
            poll_interval_secs: 1,
            ..ReindexConfig::default()
        };
        assert_eq!(reindex.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        let delays: Vec<u64> = (0..5)
            .map(|a| retry.delay_for(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![25, 50, 100, 200, 400]);
        assert_eq!(retry.delay_for(9).as_millis(), 400);
    }

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
[db]
path = "/tmp/index.sqlite"

[analyzer.profiles.default]
enable_stemming = true
stopwords = ["the", "and"]

[merge]
strategy = "weighted-average"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.merge.strategy, MergeStrategyKind::WeightedAverage);
        assert!(config.analyzer.profiles["default"].enable_stemming);
        assert_eq!(config.analyzer.profiles["default"].stopwords.len(), 2);
    }

    #[test]
    fn rejects_out_of_range_merge_weight() {
        let mut config = Config::with_db_path("/tmp/x.sqlite");
        config.merge.fuzzy_weight = 1.5;
        assert!(validate(&config).is_err());
    }
}
