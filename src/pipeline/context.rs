//! Run-scoped processing context
//!
//! One `ProcessingContext` is created per run and shared by reference with
//! every stage. Counters are atomics and the phase is a single atomic byte,
//! so the context can be read from progress reporters or future workers
//! without locking. Only index-limit admission takes a lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::incremental::OutputNaming;
use crate::types::EntityId;

/// Pipeline phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Initialization = 0,
    DownloadingFeed = 1,
    ParsingFeed = 2,
    ExtractingReferences = 3,
    DownloadingArtifacts = 4,
    AnalyzingArtifacts = 5,
    Completed = 6,
    Error = 7,
}

impl Phase {
    /// Phases that run a stage, in order
    pub const STAGES: [Phase; 5] = [
        Phase::DownloadingFeed,
        Phase::ParsingFeed,
        Phase::ExtractingReferences,
        Phase::DownloadingArtifacts,
        Phase::AnalyzingArtifacts,
    ];

    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Initialization,
            1 => Phase::DownloadingFeed,
            2 => Phase::ParsingFeed,
            3 => Phase::ExtractingReferences,
            4 => Phase::DownloadingArtifacts,
            5 => Phase::AnalyzingArtifacts,
            6 => Phase::Completed,
            _ => Phase::Error,
        }
    }

    /// The only non-error successor
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Initialization => Some(Phase::DownloadingFeed),
            Phase::DownloadingFeed => Some(Phase::ParsingFeed),
            Phase::ParsingFeed => Some(Phase::ExtractingReferences),
            Phase::ExtractingReferences => Some(Phase::DownloadingArtifacts),
            Phase::DownloadingArtifacts => Some(Phase::AnalyzingArtifacts),
            Phase::AnalyzingArtifacts => Some(Phase::Completed),
            Phase::Completed | Phase::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Phase::Error || self.successor() == Some(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initialization => "initialization",
            Phase::DownloadingFeed => "downloading_feed",
            Phase::ParsingFeed => "parsing_feed",
            Phase::ExtractingReferences => "extracting_references",
            Phase::DownloadingArtifacts => "downloading_artifacts",
            Phase::AnalyzingArtifacts => "analyzing_artifacts",
            Phase::Completed => "completed",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },
}

/// Immutable options for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: Uuid,
    pub index_limit: Option<u64>,
    pub resume: bool,
    pub incremental: bool,
    pub baseline_path: Option<PathBuf>,
    pub date_token: String,
    pub output_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub base_name: String,
    pub requests_per_window: u32,
    pub rate_window: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub validate_artifacts: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        let naming = match &config.run.date_token {
            Some(token) => OutputNaming::new(token.clone(), config.incremental.enabled),
            None => OutputNaming::today(config.incremental.enabled),
        };

        Self {
            run_id: Uuid::new_v4(),
            index_limit: config.run.index_limit,
            resume: config.run.resume,
            incremental: config.incremental.enabled,
            baseline_path: config.incremental.baseline_path.clone(),
            date_token: naming.token().to_string(),
            output_dir: config.run.output_dir.clone(),
            artifact_dir: config.run.artifact_dir.clone(),
            base_name: config.run.base_name.clone(),
            requests_per_window: config.rate_limit.requests_per_window,
            rate_window: Duration::from_millis(config.rate_limit.window_ms),
            max_retries: config.retry.max_retries,
            retry_delay: Duration::from_millis(config.retry.delay_ms),
            validate_artifacts: config.validation.enabled,
        }
    }

    pub fn naming(&self) -> OutputNaming {
        OutputNaming::new(self.date_token.clone(), self.incremental)
    }
}

/// Wall-clock time spent in one phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Serializable view of the context at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub run_id: Uuid,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub processed_entities: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub items_analyzed: u64,
    pub last_error: Option<String>,
    pub current_file: Option<PathBuf>,
    pub timings: Vec<PhaseTiming>,
}

struct ActivePhase {
    phase: Phase,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Shared state for one run
pub struct ProcessingContext {
    options: RunOptions,
    phase: AtomicU8,
    processed_entities: AtomicU64,
    processed_ids: Mutex<HashSet<EntityId>>,
    successful_downloads: AtomicU64,
    failed_downloads: AtomicU64,
    items_analyzed: AtomicU64,
    last_error: RwLock<Option<String>>,
    current_file: RwLock<Option<PathBuf>>,
    started_at: DateTime<Utc>,
    started: Instant,
    active: Mutex<ActivePhase>,
    timings: Mutex<Vec<PhaseTiming>>,
}

impl ProcessingContext {
    pub fn new(options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            options,
            phase: AtomicU8::new(Phase::Initialization as u8),
            processed_entities: AtomicU64::new(0),
            processed_ids: Mutex::new(HashSet::new()),
            successful_downloads: AtomicU64::new(0),
            failed_downloads: AtomicU64::new(0),
            items_analyzed: AtomicU64::new(0),
            last_error: RwLock::new(None),
            current_file: RwLock::new(None),
            started_at: now,
            started: Instant::now(),
            active: Mutex::new(ActivePhase {
                phase: Phase::Initialization,
                started_at: now,
                started: Instant::now(),
            }),
            timings: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move to `next`; anything but the successor or `Error` is rejected
    pub fn transition_to(&self, next: Phase) -> Result<(), ContextError> {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            let from = Phase::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(ContextError::InvalidTransition { from, to: next });
            }
            match self.phase.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.close_phase(next);
        tracing::debug!("Phase -> {}", next);
        Ok(())
    }

    fn close_phase(&self, next: Phase) {
        let mut active = self.active.lock();
        self.timings.lock().push(PhaseTiming {
            phase: active.phase,
            started_at: active.started_at,
            duration_ms: active.started.elapsed().as_millis() as u64,
        });
        *active = ActivePhase {
            phase: next,
            started_at: Utc::now(),
            started: Instant::now(),
        };
    }

    /// Record `error` and move to `Error` unless already terminal
    pub fn fail(&self, error: impl fmt::Display) {
        let message = error.to_string();
        tracing::error!("Run failed in {}: {}", self.phase(), message);
        *self.last_error.write() = Some(message);
        if let Err(e) = self.transition_to(Phase::Error) {
            tracing::debug!("{}", e);
        }
    }

    /// Claim `id` for processing under the index limit.
    ///
    /// Every entity counts once per run, whichever stage handles it first,
    /// so later stages keep working on entities an earlier stage admitted.
    /// Returns `false` once the limit is reached for a new entity.
    pub fn admit(&self, id: &str) -> bool {
        let mut seen = self.processed_ids.lock();
        if seen.contains(id) {
            return true;
        }
        if self.has_reached_limit() {
            return false;
        }
        seen.insert(id.to_string());
        self.processed_entities.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn record_download_success(&self) {
        self.successful_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_failure(&self) {
        self.failed_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_analyzed(&self) {
        self.items_analyzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed_entities(&self) -> u64 {
        self.processed_entities.load(Ordering::Relaxed)
    }

    pub fn successful_downloads(&self) -> u64 {
        self.successful_downloads.load(Ordering::Relaxed)
    }

    pub fn failed_downloads(&self) -> u64 {
        self.failed_downloads.load(Ordering::Relaxed)
    }

    pub fn items_analyzed(&self) -> u64 {
        self.items_analyzed.load(Ordering::Relaxed)
    }

    /// Whether the index limit has been reached
    pub fn has_reached_limit(&self) -> bool {
        match self.options.index_limit {
            Some(limit) => self.processed_entities() >= limit,
            None => false,
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn set_current_file(&self, path: Option<&Path>) {
        *self.current_file.write() = path.map(Path::to_path_buf);
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.current_file.read().clone()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let mut timings = self.timings.lock().clone();
        {
            let active = self.active.lock();
            if !active.phase.is_terminal() {
                timings.push(PhaseTiming {
                    phase: active.phase,
                    started_at: active.started_at,
                    duration_ms: active.started.elapsed().as_millis() as u64,
                });
            }
        }

        ContextSnapshot {
            run_id: self.options.run_id,
            phase: self.phase(),
            started_at: self.started_at,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            processed_entities: self.processed_entities(),
            successful_downloads: self.successful_downloads(),
            failed_downloads: self.failed_downloads(),
            items_analyzed: self.items_analyzed(),
            last_error: self.last_error(),
            current_file: self.current_file(),
            timings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn context(limit: Option<u64>) -> ProcessingContext {
        let mut config = Config::default();
        config.run.index_limit = limit;
        config.run.date_token = Some("20240115".to_string());
        ProcessingContext::new(RunOptions::from_config(&config))
    }

    #[test]
    fn test_walks_every_phase_in_order() {
        let ctx = context(None);
        assert_eq!(ctx.phase(), Phase::Initialization);

        for phase in Phase::STAGES {
            ctx.transition_to(phase).unwrap();
            assert_eq!(ctx.phase(), phase);
        }
        ctx.transition_to(Phase::Completed).unwrap();

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.phase, Phase::Completed);
        assert_eq!(snapshot.timings.len(), 6);
        assert_eq!(snapshot.timings[0].phase, Phase::Initialization);
        assert_eq!(snapshot.timings[5].phase, Phase::AnalyzingArtifacts);
    }

    #[test]
    fn test_rejects_skipping_a_phase() {
        let ctx = context(None);
        let err = ctx.transition_to(Phase::ParsingFeed).unwrap_err();
        assert_eq!(
            err,
            ContextError::InvalidTransition {
                from: Phase::Initialization,
                to: Phase::ParsingFeed
            }
        );
        assert_eq!(ctx.phase(), Phase::Initialization);
        assert!(ctx.transition_to(Phase::Initialization).is_err());
    }

    #[test]
    fn test_error_is_absorbing() {
        let ctx = context(None);
        ctx.transition_to(Phase::DownloadingFeed).unwrap();
        ctx.fail("cancelled");

        assert_eq!(ctx.phase(), Phase::Error);
        assert_eq!(ctx.last_error().as_deref(), Some("cancelled"));
        assert!(ctx.transition_to(Phase::ParsingFeed).is_err());
        assert!(ctx.transition_to(Phase::Error).is_err());
        assert!(ctx.transition_to(Phase::Completed).is_err());
    }

    #[test]
    fn test_completed_is_terminal() {
        assert!(!Phase::Completed.can_transition_to(Phase::Error));
        assert!(Phase::AnalyzingArtifacts.can_transition_to(Phase::Error));
    }

    #[test]
    fn test_index_limit() {
        let ctx = context(Some(2));
        assert!(!ctx.has_reached_limit());
        assert!(ctx.admit("a"));
        assert!(!ctx.has_reached_limit());
        assert!(ctx.admit("b"));
        assert!(ctx.has_reached_limit());
        assert!(!ctx.admit("c"));
        assert_eq!(ctx.processed_entities(), 2);

        let unlimited = context(None);
        for i in 0..100 {
            assert!(unlimited.admit(&i.to_string()));
        }
        assert!(!unlimited.has_reached_limit());
    }

    #[test]
    fn test_admitted_entity_counts_once_across_stages() {
        let ctx = context(Some(2));
        assert!(ctx.admit("a"));
        assert!(ctx.admit("b"));

        // A later stage sees the same entities again
        assert!(ctx.admit("a"));
        assert!(ctx.admit("b"));
        assert_eq!(ctx.processed_entities(), 2);
    }

    #[test]
    fn test_counters_across_threads() {
        let ctx = Arc::new(context(None));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        ctx.record_download_success();
                        ctx.record_analyzed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ctx.successful_downloads(), 1000);
        assert_eq!(ctx.items_analyzed(), 1000);
        assert_eq!(ctx.failed_downloads(), 0);
    }

    #[test]
    fn test_current_file() {
        let ctx = context(None);
        ctx.set_current_file(Some(Path::new("out/a.csv")));
        assert_eq!(ctx.current_file(), Some(PathBuf::from("out/a.csv")));
        ctx.set_current_file(None);
        assert!(ctx.snapshot().current_file.is_none());
    }
}
