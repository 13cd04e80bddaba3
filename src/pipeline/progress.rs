//! Progress tracking for pipeline stages

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::context::Phase;

/// What happened to one record in a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    /// Record was handled and produced output
    Done,
    /// Record needed no work this run
    Skipped,
    /// Record failed; the failure was recorded
    Failed,
}

/// Per-stage record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub seen: u64,
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Progress tracker for one stage
pub struct StageProgress {
    /// Progress bar (None in quiet mode)
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
    seen: AtomicU64,
    done: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl StageProgress {
    pub fn new(phase: Phase, total_expected: Option<u64>, quiet: bool) -> Self {
        let progress_bar = if !quiet {
            let pb = match total_expected {
                Some(total) => ProgressBar::new(total),
                None => ProgressBar::new_spinner(),
            };

            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:>22} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb.set_prefix(phase.as_str());

            Some(pb)
        } else {
            None
        };

        Self {
            progress_bar,
            start_time: Instant::now(),
            seen: AtomicU64::new(0),
            done: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Count one record
    pub fn record(&self, entity: &str, tally: Tally) {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;

        match tally {
            Tally::Done => self.done.fetch_add(1, Ordering::Relaxed),
            Tally::Skipped => self.skipped.fetch_add(1, Ordering::Relaxed),
            Tally::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(ref pb) = self.progress_bar {
            pb.set_position(seen);

            let elapsed = self.start_time.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { seen as f64 / elapsed } else { 0.0 };
            pb.set_message(format!("{:.1}/s | {}", rate, entity));
        }
    }

    pub fn counts(&self) -> StageCounts {
        StageCounts {
            seen: self.seen.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn finish(&self) {
        if let Some(ref pb) = self.progress_bar {
            let counts = self.counts();
            pb.finish_with_message(format!(
                "{} done, {} skipped, {} failed",
                counts.done, counts.skipped, counts.failed
            ));
        }
    }

    pub fn abandon(&self, reason: &str) {
        if let Some(ref pb) = self.progress_bar {
            pb.abandon_with_message(reason.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counts() {
        let progress = StageProgress::new(Phase::DownloadingArtifacts, Some(3), true);

        progress.record("1", Tally::Done);
        progress.record("2", Tally::Skipped);
        progress.record("3", Tally::Failed);
        progress.record("4", Tally::Done);
        progress.finish();

        assert_eq!(
            progress.counts(),
            StageCounts { seen: 4, done: 2, skipped: 1, failed: 1 }
        );
    }
}
