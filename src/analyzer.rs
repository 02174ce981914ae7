//! Text analysis: Unicode normalization, tokenization, stopword filtering
//! and optional stemming.
//!
//! Every piece of text that reaches the projection or a MATCH expression
//! goes through this module, so normalization must be idempotent and
//! tokenization deterministic. Profiles are configured via
//! [`AnalyzerConfig`]; the default profile is always resolvable.

use std::collections::{HashMap, HashSet};

use rust_stemmers::{Algorithm, Stemmer};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::{AnalyzerConfig, ProfileConfig};
use crate::error::{IndexError, Result};

/// Compiled analyzer with all configured profiles.
pub struct Analyzer {
    default_profile: String,
    profiles: HashMap<String, CompiledProfile>,
}

struct CompiledProfile {
    options: ProfileConfig,
    stopwords: HashSet<String>,
    stemmer: Option<Stemmer>,
}

impl Analyzer {
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self> {
        let mut profiles = HashMap::new();
        for (name, options) in &config.profiles {
            profiles.insert(name.clone(), compile_profile(options)?);
        }
        // The default profile must resolve even when the config names none.
        profiles
            .entry(config.default_profile.clone())
            .or_insert_with(|| {
                compile_profile(&ProfileConfig::default()).expect("builtin profile compiles")
            });
        Ok(Self {
            default_profile: config.default_profile.clone(),
            profiles,
        })
    }

    /// Lowercase, NFD-decompose, strip combining marks, apply the special
    /// fold map and recompose NFC. Idempotent.
    pub fn normalize(&self, text: &str) -> String {
        let lowered: String = text.chars().flat_map(char::to_lowercase).collect();
        let mut folded = String::with_capacity(lowered.len());
        for c in lowered.nfd() {
            if is_combining_mark(c) {
                continue;
            }
            push_folded(&mut folded, c);
        }
        folded.nfc().collect()
    }

    /// Splits normalized text into tokens: letter runs (plus digits when the
    /// profile keeps numbers), filename joiners `-_.` retained or split per
    /// profile, stopwords removed after normalization, optional stemming.
    pub fn tokenize(&self, text: &str, profile: Option<&str>) -> Result<Vec<String>> {
        let profile = self.resolve(profile)?;
        let normalized = self.normalize(text);

        let mut tokens = Vec::new();
        let mut current = String::new();
        for c in normalized.chars() {
            let is_word = c.is_alphabetic() || (profile.options.keep_numbers && c.is_numeric());
            let is_joiner =
                !profile.options.split_filenames && matches!(c, '-' | '_' | '.') && !current.is_empty();
            if is_word || is_joiner {
                current.push(c);
            } else {
                flush_token(&mut current, profile, &mut tokens);
            }
        }
        flush_token(&mut current, profile, &mut tokens);
        Ok(tokens)
    }

    /// Tokenizes with the default profile.
    pub fn tokenize_default(&self, text: &str) -> Vec<String> {
        self.tokenize(text, None)
            .expect("default profile always resolves")
    }

    pub fn default_profile(&self) -> &str {
        &self.default_profile
    }

    pub fn profile_language(&self, profile: Option<&str>) -> Result<&str> {
        Ok(&self.resolve(profile)?.options.language)
    }

    /// Deterministic rendering of the full analyzer configuration. Any
    /// change to profiles, stopwords, stemming or flags changes this string
    /// and therefore the analyzer version hash.
    pub fn fingerprint(&self) -> String {
        let mut names: Vec<&String> = self.profiles.keys().collect();
        names.sort();

        let mut out = format!("default={}", self.default_profile);
        for name in names {
            let profile = &self.profiles[name];
            let mut stopwords: Vec<&String> = profile.stopwords.iter().collect();
            stopwords.sort();
            out.push_str(&format!(
                ";profile={}{{stemming={},keep_numbers={},split_filenames={},language={},stopwords=[",
                name,
                profile.options.enable_stemming,
                profile.options.keep_numbers,
                profile.options.split_filenames,
                profile.options.language,
            ));
            for (i, word) in stopwords.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(word);
            }
            out.push_str("]}");
        }
        out
    }

    fn resolve(&self, profile: Option<&str>) -> Result<&CompiledProfile> {
        let name = profile.unwrap_or(&self.default_profile);
        self.profiles
            .get(name)
            .ok_or_else(|| IndexError::UnknownAnalyzerProfile(name.to_string()))
    }
}

fn compile_profile(options: &ProfileConfig) -> Result<CompiledProfile> {
    let stemmer = if options.enable_stemming {
        Some(Stemmer::create(stemmer_algorithm(&options.language)?))
    } else {
        None
    };

    // Stopwords are compared post-normalization, so store them normalized.
    let normalizer = bare_normalizer();
    let stopwords = options
        .stopwords
        .iter()
        .map(|w| normalizer.normalize(w))
        .collect();

    Ok(CompiledProfile {
        options: options.clone(),
        stopwords,
        stemmer,
    })
}

/// Normalization is profile-independent; a bare analyzer carries no
/// profiles and only exists so stopword compilation can reuse it.
fn bare_normalizer() -> Analyzer {
    Analyzer {
        default_profile: String::new(),
        profiles: HashMap::new(),
    }
}

fn stemmer_algorithm(language: &str) -> Result<Algorithm> {
    match language {
        "english" => Ok(Algorithm::English),
        "german" => Ok(Algorithm::German),
        "french" => Ok(Algorithm::French),
        "spanish" => Ok(Algorithm::Spanish),
        "italian" => Ok(Algorithm::Italian),
        "portuguese" => Ok(Algorithm::Portuguese),
        "dutch" => Ok(Algorithm::Dutch),
        "swedish" => Ok(Algorithm::Swedish),
        "norwegian" => Ok(Algorithm::Norwegian),
        "danish" => Ok(Algorithm::Danish),
        "russian" => Ok(Algorithm::Russian),
        "finnish" => Ok(Algorithm::Finnish),
        other => Err(IndexError::InvalidArgument(format!(
            "unsupported stemmer language: {other}"
        ))),
    }
}

fn flush_token(current: &mut String, profile: &CompiledProfile, tokens: &mut Vec<String>) {
    if current.is_empty() {
        return;
    }
    let token = current
        .trim_end_matches(|c| matches!(c, '-' | '_' | '.'))
        .to_string();
    current.clear();
    if token.is_empty() || profile.stopwords.contains(&token) {
        return;
    }
    match &profile.stemmer {
        Some(stemmer) => tokens.push(stemmer.stem(&token).into_owned()),
        None => tokens.push(token),
    }
}

/// Special fold map applied between mark stripping and NFC recomposition.
fn push_folded(out: &mut String, c: char) {
    match c {
        'ß' => out.push_str("ss"),
        'ø' => out.push('o'),
        'đ' => out.push('d'),
        'þ' => out.push_str("th"),
        'æ' => out.push_str("ae"),
        'œ' => out.push_str("oe"),
        'ł' => out.push('l'),
        _ => out.push(c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;

    fn analyzer() -> Analyzer {
        Analyzer::from_config(&AnalyzerConfig::default()).unwrap()
    }

    fn analyzer_with(profile: ProfileConfig) -> Analyzer {
        let mut config = AnalyzerConfig::default();
        config.profiles.insert("default".into(), profile);
        Analyzer::from_config(&config).unwrap()
    }

    #[test]
    fn normalize_lowercases_and_strips_marks() {
        let a = analyzer();
        assert_eq!(a.normalize("Čaj Über Café"), "caj uber cafe");
    }

    #[test]
    fn normalize_applies_special_folds() {
        let a = analyzer();
        assert_eq!(a.normalize("Straße Østergade Đorđe Þing"), "strasse ostergade dorde thing");
    }

    #[test]
    fn normalize_is_idempotent() {
        let a = analyzer();
        for input in ["Straße", "Œuvre", "naïve RÉSUMÉ", "łódź", "plain ascii 42"] {
            let once = a.normalize(input);
            assert_eq!(a.normalize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn tokenize_splits_on_non_letters() {
        let a = analyzer();
        assert_eq!(
            a.tokenize("Quarterly Report, 2024!", None).unwrap(),
            vec!["quarterly", "report", "2024"]
        );
    }

    #[test]
    fn tokenize_drops_numbers_when_configured() {
        let a = analyzer_with(ProfileConfig {
            keep_numbers: false,
            ..ProfileConfig::default()
        });
        assert_eq!(
            a.tokenize("report 2024 final", None).unwrap(),
            vec!["report", "final"]
        );
    }

    #[test]
    fn tokenize_filename_joiners() {
        let split = analyzer();
        assert_eq!(
            split.tokenize("annual_report-v2.pdf", None).unwrap(),
            vec!["annual", "report", "v2", "pdf"]
        );

        let joined = analyzer_with(ProfileConfig {
            split_filenames: false,
            ..ProfileConfig::default()
        });
        assert_eq!(
            joined.tokenize("annual_report-v2.pdf", None).unwrap(),
            vec!["annual_report-v2.pdf"]
        );
    }

    #[test]
    fn tokenize_removes_normalized_stopwords() {
        let a = analyzer_with(ProfileConfig {
            stopwords: vec!["The".into(), "ünd".into()],
            ..ProfileConfig::default()
        });
        let tokens = a.tokenize("The report und the appendix", None).unwrap();
        assert_eq!(tokens, vec!["report", "appendix"]);
        for token in &tokens {
            assert_ne!(token, "the");
            assert_ne!(token, "und");
        }
    }

    #[test]
    fn tokenize_applies_stemmer() {
        let a = analyzer_with(ProfileConfig {
            enable_stemming: true,
            ..ProfileConfig::default()
        });
        assert_eq!(
            a.tokenize("running reports", None).unwrap(),
            vec!["run", "report"]
        );
    }

    #[test]
    fn unknown_profile_is_fatal() {
        let a = analyzer();
        let err = a.tokenize("text", Some("missing")).unwrap_err();
        assert!(matches!(err, IndexError::UnknownAnalyzerProfile(name) if name == "missing"));
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let mut first = AnalyzerConfig::default();
        first.profiles.insert(
            "a".into(),
            ProfileConfig {
                stopwords: vec!["x".into(), "y".into()],
                ..ProfileConfig::default()
            },
        );
        first.profiles.insert("b".into(), ProfileConfig::default());

        let mut second = AnalyzerConfig::default();
        second.profiles.insert("b".into(), ProfileConfig::default());
        second.profiles.insert(
            "a".into(),
            ProfileConfig {
                stopwords: vec!["y".into(), "x".into()],
                ..ProfileConfig::default()
            },
        );

        let fp1 = Analyzer::from_config(&first).unwrap().fingerprint();
        let fp2 = Analyzer::from_config(&second).unwrap().fingerprint();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_changes_with_stopwords() {
        let plain = analyzer().fingerprint();
        let with_stopwords = analyzer_with(ProfileConfig {
            stopwords: vec!["the".into()],
            ..ProfileConfig::default()
        })
        .fingerprint();
        assert_ne!(plain, with_stopwords);
    }
}
