//! Incremental runs
//!
//! Compares the current feed against a prior run's output so that only new
//! or changed entities are processed.

pub mod baseline;
pub mod diff;

pub use baseline::Baseline;
pub use diff::{parse_date, DiffDecision, IncrementalDiffEngine, IncrementalStats, OutputNaming};

use std::path::PathBuf;
use thiserror::Error;

use crate::records::RecordError;

/// Errors raised while loading a baseline
#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("baseline file not found: {0}")]
    NotFound(PathBuf),

    #[error("baseline {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },

    #[error("cannot read baseline: {0}")]
    Record(#[from] RecordError),
}
