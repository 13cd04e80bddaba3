//! Checkpoint/resume
//!
//! Prior progress is reconstructed from the committed output of each stage:
//! the download-status file for downloads, the result file for analysis.

pub mod store;
pub mod validation;

pub use store::{
    compute_processing_stats, load_completed_ids, load_download_status, retry_decision,
    DownloadPlan, DownloadState, PriorDownload, ProcessingStats, ResumeAction, ResumeStateStore,
    ResumeStats, COL_ARTIFACT_FILE, COL_DOWNLOADED_AT, COL_DOWNLOAD_STATUS,
};
pub use validation::{ArtifactRejection, ArtifactValidator};

use thiserror::Error;

use crate::records::RecordError;

/// Errors raised while reconstructing resume state
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("cannot read prior output: {0}")]
    Record(#[from] RecordError),
}
