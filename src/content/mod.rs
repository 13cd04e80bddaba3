//! Content extraction and classification
//!
//! Turns a validated artifact into cleaned text and a structured
//! classification. Both pieces sit behind traits so the pipeline can be
//! driven with stub implementations in tests.

mod classifier;
mod pdf;

pub use classifier::{
    default_pattern_sets, Classification, ContentClassifier, KeywordClassifier, PatternSet,
};
pub use pdf::{clean_text, PdfTextExtractor, PDF_SIGNATURE};

use anyhow::Result;

/// Extracts plain text from raw document bytes
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<String>;
}
