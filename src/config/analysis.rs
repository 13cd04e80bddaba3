//! Validation, classification and incremental-run configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::content::{default_pattern_sets, PatternSet};
use crate::records::{COL_FILING_DATE, COL_ID};

/// Artifact validation rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Re-validate prior successful artifacts when resuming
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Smallest acceptable artifact in bytes
    #[serde(default = "default_min_size")]
    pub min_size: u64,
    /// Reject artifacts that yield no text
    #[serde(default = "default_true")]
    pub require_text: bool,
}

fn default_true() -> bool {
    true
}

fn default_min_size() -> u64 {
    1024
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: default_min_size(),
            require_text: true,
        }
    }
}

/// Keyword labels applied to artifact text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_pattern_sets")]
    pub pattern_sets: Vec<PatternSet>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            pattern_sets: default_pattern_sets(),
        }
    }
}

/// Incremental run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Prior cumulative output to diff against
    #[serde(default)]
    pub baseline_path: Option<PathBuf>,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_date_column")]
    pub date_column: String,
}

fn default_id_column() -> String {
    COL_ID.to_string()
}

fn default_date_column() -> String {
    COL_FILING_DATE.to_string()
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            baseline_path: None,
            id_column: default_id_column(),
            date_column: default_date_column(),
        }
    }
}
