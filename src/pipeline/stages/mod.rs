//! Pipeline stages
//!
//! Each stage reads the previous stage's committed output and produces its
//! own. That output doubles as the checkpoint a resumed run starts from.

mod analyze;
mod download;
mod feed;
mod references;

pub use analyze::{analyze_artifacts, COL_ANALYZED_AT, COL_MATCHED_LABELS, COL_MATCH_COUNT, COL_TEXT_LENGTH};
pub use download::download_artifacts;
pub use feed::{download_feed, parse_feed};
pub use references::{extract_references, resolve_artifact_url, COL_ARTIFACT_URL};

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use super::context::{Phase, ProcessingContext, RunOptions};
use super::orchestrator::Collaborators;
use super::progress::StageCounts;
use crate::config::{Config, FeedConfig};
use crate::feed::FeedError;
use crate::fetching::{CancelSignal, FetchError, FetchedArtifact, RateLimiter, RetryError, RetryExecutor};
use crate::incremental::{BaselineError, IncrementalStats};
use crate::records::RecordError;
use crate::resume::{ArtifactValidator, ProcessingStats, ResumeError, ResumeStats};

/// How a stage treats existing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    Standard,
    Resume,
}

/// Fatal stage errors. Per-record failures never surface here.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage input {0} does not exist")]
    MissingInput(PathBuf),

    #[error(transparent)]
    Records(#[from] RecordError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Baseline(#[from] BaselineError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error("feed download failed: {0}")]
    FeedDownload(String),

    #[error("{0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// What one stage did
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub phase: Phase,
    pub mode: StageMode,
    pub output: PathBuf,
    /// Existing output was used as-is
    pub reused: bool,
    pub counts: StageCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalStats>,
}

impl StageReport {
    pub fn new(phase: Phase, mode: StageMode, output: &Path, counts: StageCounts) -> Self {
        Self {
            phase,
            mode,
            output: output.to_path_buf(),
            reused: false,
            counts,
            resume: None,
            processing: None,
            incremental: None,
        }
    }

    pub fn reused(phase: Phase, mode: StageMode, output: &Path) -> Self {
        Self {
            reused: true,
            ..Self::new(phase, mode, output, StageCounts::default())
        }
    }
}

/// Stage file names for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFiles {
    pub feed: PathBuf,
    pub parsed: PathBuf,
    pub references: PathBuf,
    pub downloads: PathBuf,
    pub results: PathBuf,
    pub summary: PathBuf,
}

impl StageFiles {
    pub fn new(options: &RunOptions, feed: &FeedConfig) -> Self {
        let naming = options.naming();
        let dir = &options.output_dir;
        let base = &options.base_name;
        let stage = |suffix: &str| dir.join(naming.csv(&format!("{}_{}", base, suffix)));

        Self {
            feed: feed
                .local_path
                .clone()
                .unwrap_or_else(|| dir.join(feed.file_name())),
            parsed: stage("parsed"),
            references: stage("references"),
            downloads: stage("downloads"),
            results: stage("results"),
            summary: dir.join(naming.summary(base)),
        }
    }

    /// Dated stage outputs already on disk, i.e. what a resume can pick up
    pub fn existing_outputs(&self) -> Vec<&Path> {
        [&self.parsed, &self.references, &self.downloads, &self.results]
            .into_iter()
            .filter(|path| path.exists())
            .map(PathBuf::as_path)
            .collect()
    }
}

/// Everything a stage needs, borrowed from the orchestrator for one run
pub struct StageEnv<'a> {
    pub config: &'a Config,
    pub context: &'a ProcessingContext,
    pub files: &'a StageFiles,
    pub collaborators: &'a Collaborators,
    pub limiter: &'a RateLimiter,
    pub retry: &'a RetryExecutor,
    pub validator: &'a ArtifactValidator,
    pub cancel: &'a CancelSignal,
    pub quiet: bool,
}

impl StageEnv<'_> {
    pub fn options(&self) -> &RunOptions {
        self.context.options()
    }

    /// Resume when asked to and the stage's output already exists
    pub fn mode_for(&self, output: &Path) -> StageMode {
        if self.options().resume && output.exists() {
            StageMode::Resume
        } else {
            StageMode::Standard
        }
    }

    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Fetch `url` to `dest`, rate limited and retried
    pub async fn fetch(
        &self,
        label: &str,
        url: &Url,
        dest: &Path,
    ) -> Result<FetchedArtifact, RetryError<FetchError>> {
        let fetcher = &self.collaborators.fetcher;
        let limiter = self.limiter;
        let cancel = self.cancel;

        self.retry
            .execute(label, cancel, |attempt| async move {
                limiter.acquire(cancel).await.map_err(|_| FetchError::Cancelled)?;
                tracing::debug!("Fetching {} (attempt {})", url, attempt);
                tokio::select! {
                    result = fetcher.fetch(url, dest) => result,
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                }
            })
            .await
    }
}

fn log_limit_reached(env: &StageEnv<'_>) {
    tracing::info!(
        "Reached index limit of {}",
        env.options().index_limit.unwrap_or_default()
    );
}

/// Whether a failed fetch was really a cancellation
fn fetch_was_cancelled(error: &RetryError<FetchError>, cancel: &CancelSignal) -> bool {
    cancel.is_cancelled()
        || error.is_cancelled()
        || matches!(
            error,
            RetryError::NonTransient {
                error: FetchError::Cancelled,
                ..
            }
        )
}

/// Remove a temp file left behind by an aborted stage
fn discard(temp: &Path) {
    if let Err(e) = std::fs::remove_file(temp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("Failed to remove {}: {}", temp.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files_in(dir: &Path, token: &str) -> StageFiles {
        let mut config = Config::default();
        config.run.output_dir = dir.to_path_buf();
        config.run.date_token = Some(token.to_string());
        StageFiles::new(&RunOptions::from_config(&config), &config.feed)
    }

    #[test]
    fn test_existing_outputs_follow_date_token() {
        let dir = TempDir::new().unwrap();
        let yesterday = files_in(dir.path(), "20240114");
        std::fs::write(&yesterday.parsed, "EntityId\n").unwrap();
        std::fs::write(&yesterday.downloads, "EntityId\n").unwrap();

        assert_eq!(
            yesterday.existing_outputs(),
            vec![yesterday.parsed.as_path(), yesterday.downloads.as_path()]
        );
        assert!(files_in(dir.path(), "20240115").existing_outputs().is_empty());
    }
}
