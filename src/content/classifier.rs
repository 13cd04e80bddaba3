//! Keyword classifier for extracted artifact text
//!
//! Stateless: each call is a pure function of the text and the compiled
//! pattern sets.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named group of patterns; the label matches if any pattern matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSet {
    pub label: String,
    pub patterns: Vec<String>,
}

impl PatternSet {
    pub fn new(label: impl Into<String>, patterns: &[&str]) -> Self {
        Self {
            label: label.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Default label sets for adviser brochures
pub fn default_pattern_sets() -> Vec<PatternSet> {
    vec![
        PatternSet::new("performance_fees", &[r"performance[- ]based fees?", r"incentive fees?"]),
        PatternSet::new("custody", &[r"\bcustody\b", r"qualified custodian"]),
        PatternSet::new(
            "disciplinary",
            &[r"disciplinary (?:action|event|history|information)", r"\bsanction(?:s|ed)?\b"],
        ),
        PatternSet::new("wrap_fee", &[r"wrap fee program"]),
        PatternSet::new(
            "digital_assets",
            &[r"crypto(?:currency|currencies|-assets?)?\b", r"digital assets?"],
        ),
        PatternSet::new("private_funds", &[r"private funds?", r"hedge funds?"]),
    ]
}

/// Result of classifying one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Labels with at least one match, in configuration order
    pub labels: Vec<String>,
    /// Match count per matched label
    pub matches: BTreeMap<String, usize>,
    /// Total matches across labels
    pub total_matches: usize,
}

impl Classification {
    /// Labels joined for a CSV cell
    pub fn labels_cell(&self) -> String {
        self.labels.join(";")
    }
}

/// Pure text classifier used by the analysis stage
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, text: &str, entity_id: &str) -> Classification;
}

/// Case-insensitive regex keyword classifier
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(String, Vec<Regex>)>,
}

impl KeywordClassifier {
    /// Compile pattern sets; an invalid pattern is an error naming the label
    pub fn new(sets: &[PatternSet]) -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(sets.len());
        for set in sets {
            let compiled = set
                .patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){}", p)))
                .collect::<Result<Vec<_>, _>>()?;
            rules.push((set.label.clone(), compiled));
        }
        Ok(Self { rules })
    }

    pub fn label_count(&self) -> usize {
        self.rules.len()
    }
}

impl ContentClassifier for KeywordClassifier {
    fn classify(&self, text: &str, entity_id: &str) -> Classification {
        let mut result = Classification::default();

        for (label, patterns) in &self.rules {
            let count: usize = patterns.iter().map(|re| re.find_iter(text).count()).sum();
            if count > 0 {
                result.labels.push(label.clone());
                result.matches.insert(label.clone(), count);
                result.total_matches += count;
            }
        }

        tracing::trace!(
            "Classified entity {}: {} label(s), {} match(es)",
            entity_id,
            result.labels.len(),
            result.total_matches
        );
        result
    }
}
