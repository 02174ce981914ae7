//! Drift-detection signatures.
//!
//! A signature is a pure function of (file content, analyzer configuration):
//! the analyzer version hash, the token hash over the searchable fields and
//! the normalized title. Comparing a freshly computed signature against the
//! hashes stored on the projection row decides whether a file needs
//! reindexing.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::analyzer::Analyzer;
use crate::error::Result;
use crate::model::FileDocument;

/// The drift-detection triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Hex SHA-256 of the canonical analyzer fingerprint. Flips whenever
    /// any analyzer option changes, forcing reindex of every file.
    pub analyzer_version: String,
    /// Hex SHA-256 of the newline-joined tokens of title ∥ author ∥ mime ∥
    /// metadata text. `None` when the fields produce no tokens.
    pub token_hash: Option<String>,
    pub normalized_title: String,
}

pub struct SignatureCalculator {
    analyzer: Arc<Analyzer>,
    analyzer_version: String,
}

impl SignatureCalculator {
    pub fn new(analyzer: Arc<Analyzer>) -> Self {
        let analyzer_version = hex_sha256(analyzer.fingerprint().as_bytes());
        Self {
            analyzer,
            analyzer_version,
        }
    }

    pub fn analyzer_version(&self) -> &str {
        &self.analyzer_version
    }

    pub fn analyzer(&self) -> &Arc<Analyzer> {
        &self.analyzer
    }

    pub fn compute(&self, file: &FileDocument) -> Result<Signature> {
        let mut source = String::new();
        source.push_str(&file.title);
        source.push('\n');
        if let Some(author) = &file.author {
            source.push_str(author);
        }
        source.push('\n');
        source.push_str(&file.mime);
        source.push('\n');
        if let Some(metadata_text) = &file.metadata_text {
            source.push_str(metadata_text);
        }

        let tokens = self.analyzer.tokenize(&source, None)?;
        let token_hash = if tokens.is_empty() {
            None
        } else {
            Some(hex_sha256(tokens.join("\n").as_bytes()))
        };

        Ok(Signature {
            analyzer_version: self.analyzer_version.clone(),
            token_hash,
            normalized_title: self.analyzer.normalize(&file.title),
        })
    }
}

pub(crate) fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerConfig, ProfileConfig};
    use crate::model::FileContent;
    use chrono::Utc;
    use uuid::Uuid;

    fn doc(title: &str, author: Option<&str>, mime: &str, metadata: Option<&str>) -> FileDocument {
        FileDocument {
            id: Uuid::new_v4(),
            name: format!("{title}.txt"),
            title: title.to_string(),
            author: author.map(String::from),
            mime: mime.to_string(),
            size_bytes: 3,
            created_utc: Utc::now(),
            modified_utc: Utc::now(),
            content: FileContent::from_bytes(b"abc".to_vec()),
            metadata_text: metadata.map(String::from),
            metadata_json: None,
            search_index_state: None,
        }
    }

    fn calculator() -> SignatureCalculator {
        let analyzer = Arc::new(Analyzer::from_config(&AnalyzerConfig::default()).unwrap());
        SignatureCalculator::new(analyzer)
    }

    #[test]
    fn signature_is_deterministic() {
        let calc = calculator();
        let file = doc("Quarterly Report", Some("Jane Doe"), "text/plain", None);
        let first = calc.compute(&file).unwrap();
        let second = calc.compute(&file).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn title_change_flips_only_token_hash() {
        let calc = calculator();
        let a = calc
            .compute(&doc("Quarterly Report", None, "text/plain", None))
            .unwrap();
        let b = calc
            .compute(&doc("Annual Report", None, "text/plain", None))
            .unwrap();
        assert_eq!(a.analyzer_version, b.analyzer_version);
        assert_ne!(a.token_hash, b.token_hash);
        assert_ne!(a.normalized_title, b.normalized_title);
    }

    #[test]
    fn analyzer_change_flips_version() {
        let plain = calculator();

        let mut config = AnalyzerConfig::default();
        config.profiles.insert(
            "default".into(),
            ProfileConfig {
                stopwords: vec!["the".into()],
                ..ProfileConfig::default()
            },
        );
        let stopworded =
            SignatureCalculator::new(Arc::new(Analyzer::from_config(&config).unwrap()));

        assert_ne!(plain.analyzer_version(), stopworded.analyzer_version());
    }

    #[test]
    fn empty_fields_yield_no_token_hash() {
        let calc = calculator();
        // Mime tokens alone still hash; a fully punctuation title and mime
        // with no letters produce nothing.
        let file = doc("!!!", None, "---", None);
        let signature = calc.compute(&file).unwrap();
        assert_eq!(signature.token_hash, None);
        assert_eq!(signature.normalized_title, "!!!");
    }

    #[test]
    fn normalized_title_follows_analyzer() {
        let calc = calculator();
        let signature = calc
            .compute(&doc("Straße Überblick", None, "text/plain", None))
            .unwrap();
        assert_eq!(signature.normalized_title, "strasse uberblick");
    }
}
