//! Stage orchestrator
//!
//! Sequences the stages, moving the context through its phases. A fatal
//! stage error moves the context to `Error` and stops the run; committed
//! outputs stay on disk for a later resume.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use super::context::{ContextError, ContextSnapshot, Phase, ProcessingContext, RunOptions};
use super::stages::{self, StageEnv, StageError, StageFiles, StageReport};
use crate::config::Config;
use crate::content::{ContentClassifier, KeywordClassifier, PdfTextExtractor, TextExtractor};
use crate::feed::{FeedLayout, FeedParser, XmlFeedParser};
use crate::fetching::{
    ArtifactFetcher, CancelSignal, FetchError, HttpArtifactFetcher, RateLimiter, RetryExecutor,
};
use crate::resume::ArtifactValidator;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("stage {phase} failed: {source}")]
    Stage {
        phase: Phase,
        #[source]
        source: StageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot build HTTP client: {0}")]
    Fetch(#[from] FetchError),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Stage {
                source: StageError::Cancelled,
                ..
            }
        )
    }

    /// Message recorded as the context's last error
    fn context_message(&self) -> String {
        match self {
            PipelineError::Stage { source, .. } => source.to_string(),
            other => other.to_string(),
        }
    }
}

/// Swappable adapters the stages call out to
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub feed_parser: Arc<dyn FeedParser>,
    pub extractor: Arc<dyn TextExtractor>,
    pub classifier: Arc<dyn ContentClassifier>,
}

impl Collaborators {
    /// Production adapters built from configuration
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let fetcher = HttpArtifactFetcher::new(config.fetch.to_fetch_config())?;
        let classifier = KeywordClassifier::new(&config.classifier.pattern_sets)
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        Ok(Self {
            fetcher: Arc::new(fetcher),
            feed_parser: Arc::new(XmlFeedParser::new(FeedLayout::from(&config.feed))),
            extractor: Arc::new(PdfTextExtractor::new()),
            classifier: Arc::new(classifier),
        })
    }
}

/// Written to the summary file at the end of every run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub succeeded: bool,
    pub resume: bool,
    pub incremental: bool,
    pub date_token: String,
    pub finished_at: DateTime<Utc>,
    pub context: ContextSnapshot,
    pub stages: Vec<StageReport>,
    pub files: StageFiles,
}

/// Runs the stages of one harvest
pub struct StageOrchestrator {
    config: Config,
    context: Arc<ProcessingContext>,
    collaborators: Collaborators,
    files: StageFiles,
    limiter: RateLimiter,
    retry: RetryExecutor,
    validator: ArtifactValidator,
    cancel: CancelSignal,
    quiet: bool,
}

impl StageOrchestrator {
    pub fn new(config: Config, collaborators: Collaborators, cancel: CancelSignal) -> Self {
        let options = RunOptions::from_config(&config);
        let files = StageFiles::new(&options, &config.feed);
        let limiter = RateLimiter::new(options.requests_per_window, options.rate_window);
        let retry = RetryExecutor::new(config.retry.to_policy());
        let validator =
            ArtifactValidator::from_config(&config.validation, collaborators.extractor.clone());

        Self {
            config,
            context: Arc::new(ProcessingContext::new(options)),
            collaborators,
            files,
            limiter,
            retry,
            validator,
            cancel,
            quiet: false,
        }
    }

    /// Set quiet mode (no progress bars)
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn context(&self) -> Arc<ProcessingContext> {
        self.context.clone()
    }

    pub fn files(&self) -> &StageFiles {
        &self.files
    }

    /// Run every stage in order
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let options = self.context.options();
        info!(
            "Starting run {} (token {}, resume: {}, incremental: {})",
            options.run_id, options.date_token, options.resume, options.incremental
        );

        if options.resume && self.files.existing_outputs().is_empty() {
            warn!(
                "Resume requested but no stage outputs exist for token {} in {}; running from scratch. \
                 Pass --date-token to resume a run started on another day",
                options.date_token,
                options.output_dir.display()
            );
        }

        let mut reports = Vec::new();
        let outcome = self.run_stages(&mut reports).await;

        match &outcome {
            Ok(()) => {
                self.context.transition_to(Phase::Completed)?;
                info!(
                    "Run complete: {} entities, {} downloaded, {} failed, {} analyzed",
                    self.context.processed_entities(),
                    self.context.successful_downloads(),
                    self.context.failed_downloads(),
                    self.context.items_analyzed()
                );
            }
            Err(e) => self.context.fail(e.context_message()),
        }
        self.context.set_current_file(None);

        let summary = RunSummary {
            succeeded: outcome.is_ok(),
            resume: options.resume,
            incremental: options.incremental,
            date_token: options.date_token.clone(),
            finished_at: Utc::now(),
            context: self.context.snapshot(),
            stages: reports,
            files: self.files.clone(),
        };
        if let Err(e) = write_summary(&self.files.summary, &summary) {
            error!("Failed to write run summary {}: {}", self.files.summary.display(), e);
        }

        outcome.map(|()| summary)
    }

    async fn run_stages(&self, reports: &mut Vec<StageReport>) -> Result<(), PipelineError> {
        let options = self.context.options();
        std::fs::create_dir_all(&options.output_dir)?;
        std::fs::create_dir_all(&options.artifact_dir)?;

        let env = StageEnv {
            config: &self.config,
            context: self.context.as_ref(),
            files: &self.files,
            collaborators: &self.collaborators,
            limiter: &self.limiter,
            retry: &self.retry,
            validator: &self.validator,
            cancel: &self.cancel,
            quiet: self.quiet,
        };

        self.stage(Phase::DownloadingFeed, reports, stages::download_feed(&env)).await?;
        self.stage(Phase::ParsingFeed, reports, stages::parse_feed(&env)).await?;
        self.stage(Phase::ExtractingReferences, reports, stages::extract_references(&env)).await?;
        self.stage(Phase::DownloadingArtifacts, reports, stages::download_artifacts(&env)).await?;
        self.stage(Phase::AnalyzingArtifacts, reports, stages::analyze_artifacts(&env)).await?;
        Ok(())
    }

    async fn stage<F>(
        &self,
        phase: Phase,
        reports: &mut Vec<StageReport>,
        work: F,
    ) -> Result<(), PipelineError>
    where
        F: Future<Output = Result<StageReport, StageError>>,
    {
        self.context.transition_to(phase)?;
        info!("Stage {} starting", phase);

        let report = work
            .await
            .map_err(|source| PipelineError::Stage { phase, source })?;

        info!(
            "Stage {} finished ({:?} mode{}): {} done, {} skipped, {} failed",
            phase,
            report.mode,
            if report.reused { ", output reused" } else { "" },
            report.counts.done,
            report.counts.skipped,
            report.counts.failed
        );
        reports.push(report);
        Ok(())
    }
}

/// Save the summary atomically (temp file, sync, rename)
fn write_summary(path: &Path, summary: &RunSummary) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(summary).map_err(std::io::Error::other)?;

    let temp = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&temp)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&temp, path)
}
