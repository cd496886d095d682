//! Text analysis settings and the per-index analyzer cache.
//!
//! An index's settings may declare named analyzers, each a tokenizer followed
//! by a chain of token filters:
//!
//! ```toml
//! [analyzers.default]
//! tokenizer = "standard"
//! filters = ["lowercase"]
//!
//! [analyzers.code]
//! tokenizer = "whitespace"
//! filters = ["identifier_split", "lowercase"]
//! ```
//!
//! Settings are validated once into an [`AnalyzerSet`]; an unknown tokenizer
//! or filter name fails the whole set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Name of the analyzer handed to writers and readers.
pub const DEFAULT_ANALYZER: &str = "default";

/// Declarative analyzer definitions as stored in index settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default)]
    pub analyzers: BTreeMap<String, AnalyzerDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerDef {
    pub tokenizer: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tokenizer {
    /// Runs of alphanumeric characters
    Standard,
    /// Split on whitespace only
    Whitespace,
    /// The whole input as one token
    Keyword,
}

impl Tokenizer {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "standard" | "simple" => Some(Self::Standard),
            "whitespace" => Some(Self::Whitespace),
            "keyword" => Some(Self::Keyword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFilter {
    Lowercase,
    Uppercase,
    Trim,
    /// Split camelCase, snake_case, kebab-case and letter/digit boundaries
    IdentifierSplit,
    /// Drop repeated tokens, keeping the first occurrence
    Unique,
}

impl TokenFilter {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "lowercase" => Some(Self::Lowercase),
            "uppercase" => Some(Self::Uppercase),
            "trim" => Some(Self::Trim),
            "identifier_split" => Some(Self::IdentifierSplit),
            "unique" => Some(Self::Unique),
            _ => None,
        }
    }
}

/// A validated tokenizer + filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analyzer {
    name: String,
    tokenizer: Tokenizer,
    filters: Vec<TokenFilter>,
}

impl Analyzer {
    /// Build from a definition, rejecting unknown component names.
    pub fn from_def(name: &str, def: &AnalyzerDef) -> Result<Self> {
        let tokenizer = Tokenizer::from_name(&def.tokenizer).ok_or_else(|| {
            Error::Analysis(format!(
                "analyzer [{}] unknown tokenizer [{}]",
                name, def.tokenizer
            ))
        })?;
        let filters = def
            .filters
            .iter()
            .map(|f| {
                TokenFilter::from_name(f).ok_or_else(|| {
                    Error::Analysis(format!("analyzer [{}] unknown token filter [{}]", name, f))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            tokenizer,
            filters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tokenizer(&self) -> Tokenizer {
        self.tokenizer
    }

    pub fn filters(&self) -> &[TokenFilter] {
        &self.filters
    }
}

/// Analyzers of one index, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerSet {
    analyzers: HashMap<String, Arc<Analyzer>>,
}

impl AnalyzerSet {
    /// Validate every definition. The first failure aborts the whole set.
    pub fn build(settings: &AnalysisSettings) -> Result<Self> {
        let mut analyzers = HashMap::with_capacity(settings.analyzers.len());
        for (name, def) in &settings.analyzers {
            analyzers.insert(name.clone(), Arc::new(Analyzer::from_def(name, def)?));
        }
        Ok(Self { analyzers })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Analyzer>> {
        self.analyzers.get(name).cloned()
    }

    /// The analyzer named `default`, if declared.
    pub fn default_analyzer(&self) -> Option<Arc<Analyzer>> {
        self.get(DEFAULT_ANALYZER)
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(tokenizer: &str, filters: &[&str]) -> AnalyzerDef {
        AnalyzerDef {
            tokenizer: tokenizer.to_string(),
            filters: filters.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn test_components_resolved_in_order() {
        let analyzer =
            Analyzer::from_def("code", &def("whitespace", &["identifier_split", "lowercase"]))
                .unwrap();
        assert_eq!(analyzer.name(), "code");
        assert_eq!(analyzer.tokenizer(), Tokenizer::Whitespace);
        assert_eq!(
            analyzer.filters(),
            &[TokenFilter::IdentifierSplit, TokenFilter::Lowercase]
        );

        // "simple" is an alias of the standard tokenizer.
        let analyzer = Analyzer::from_def("s", &def("simple", &[])).unwrap();
        assert_eq!(analyzer.tokenizer(), Tokenizer::Standard);
        assert!(analyzer.filters().is_empty());
    }

    #[test]
    fn test_unknown_components_fail() {
        let err = Analyzer::from_def("x", &def("ngram", &[])).unwrap_err();
        assert!(err.to_string().contains("unknown tokenizer [ngram]"));

        let mut settings = AnalysisSettings::default();
        settings
            .analyzers
            .insert("default".to_string(), def("standard", &["lowercase"]));
        settings
            .analyzers
            .insert("broken".to_string(), def("standard", &["stemmer"]));
        assert!(matches!(AnalyzerSet::build(&settings), Err(Error::Analysis(_))));
    }

    #[test]
    fn test_default_analyzer_lookup() {
        let mut settings = AnalysisSettings::default();
        settings
            .analyzers
            .insert("default".to_string(), def("whitespace", &[]));
        let set = AnalyzerSet::build(&settings).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.default_analyzer().unwrap().name(), "default");
        assert!(AnalyzerSet::default().default_analyzer().is_none());
    }
}
