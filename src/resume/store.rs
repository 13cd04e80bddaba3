//! Resume state derived from committed stage outputs
//!
//! Nothing here is persisted on its own. Each stage rebuilds its state by
//! scanning its existing output file at start-up and drops it at the end.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::validation::ArtifactValidator;
use super::ResumeError;
use crate::records::{RecordError, StageReader};
use crate::types::{DownloadOutcome, EntityId};

pub const COL_DOWNLOAD_STATUS: &str = "DownloadStatus";
pub const COL_ARTIFACT_FILE: &str = "ArtifactFile";
pub const COL_DOWNLOADED_AT: &str = "DownloadedAt";

/// Most recent download row for one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorDownload {
    /// `None` when the status tag was not recognized
    pub outcome: Option<DownloadOutcome>,
    pub artifact_file: Option<String>,
}

/// Entity id to prior download
pub type DownloadState = HashMap<EntityId, PriorDownload>;

/// Summary of prior progress for the download stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResumeStats {
    pub total: usize,
    pub already_completed: usize,
    /// Includes `corrupted`
    pub failed: usize,
    pub corrupted: usize,
    pub remaining: usize,
}

impl ResumeStats {
    /// Entities this run still has to fetch
    pub fn to_process(&self) -> usize {
        self.failed + self.remaining
    }
}

/// Summary of prior progress for the analysis stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
}

/// What a resumed download stage does with one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// Prior outcome is final
    Skip,
    /// Prior attempt failed, or its artifact no longer validates
    Retry { corrupted: bool },
    /// No prior row
    Process,
}

/// Whether a prior outcome should be attempted again.
///
/// Unknown and missing outcomes retry.
pub fn retry_decision(outcome: Option<&DownloadOutcome>) -> bool {
    match outcome {
        Some(DownloadOutcome::Failed(_)) | Some(DownloadOutcome::Error(_)) => true,
        Some(DownloadOutcome::Success)
        | Some(DownloadOutcome::Skipped)
        | Some(DownloadOutcome::NoReference)
        | Some(DownloadOutcome::InvalidReference) => false,
        Some(DownloadOutcome::NotAttempted) | None => true,
    }
}

/// Load the download-status file. The last row per entity wins.
pub fn load_download_status(path: &Path) -> Result<DownloadState, ResumeError> {
    let mut state = DownloadState::new();
    let Some(mut reader) = open_optional(path)? else {
        return Ok(state);
    };

    let Some(status_idx) = reader.column_index(COL_DOWNLOAD_STATUS) else {
        tracing::warn!(
            "{} has no {} column; treating it as empty",
            path.display(),
            COL_DOWNLOAD_STATUS
        );
        return Ok(state);
    };
    let file_idx = reader.column_index(COL_ARTIFACT_FILE);

    let mut skipped = 0usize;
    for row in reader.rows() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("Skipping row in {}: {}", path.display(), e);
                skipped += 1;
                continue;
            }
        };

        let raw = row.fields.get(status_idx).unwrap_or_default();
        let outcome = match raw.parse::<DownloadOutcome>() {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(entity = %row.record.id, "{}; will retry", e);
                None
            }
        };
        let artifact_file = file_idx
            .and_then(|i| row.fields.get(i))
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        state.insert(
            row.record.id,
            PriorDownload {
                outcome,
                artifact_file,
            },
        );
    }

    tracing::debug!(
        "Loaded {} prior download(s) from {} ({} malformed row(s) skipped)",
        state.len(),
        path.display(),
        skipped
    );
    Ok(state)
}

/// Load the ids already present in the analysis output
pub fn load_completed_ids(path: &Path) -> Result<HashSet<EntityId>, ResumeError> {
    let mut ids = HashSet::new();
    let Some(mut reader) = open_optional(path)? else {
        return Ok(ids);
    };

    for row in reader.rows() {
        match row {
            Ok(row) => {
                ids.insert(row.record.id);
            }
            Err(e) => tracing::warn!("Skipping row in {}: {}", path.display(), e),
        }
    }
    Ok(ids)
}

/// `None` for an absent file or one without an id column
fn open_optional(path: &Path) -> Result<Option<StageReader>, ResumeError> {
    if !path.exists() {
        return Ok(None);
    }
    match StageReader::open(path) {
        Ok(reader) => Ok(Some(reader)),
        Err(RecordError::MissingColumn { column, .. }) => {
            tracing::warn!("{} has no {} column; treating it as empty", path.display(), column);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn compute_processing_stats(total: usize, completed_ids: &HashSet<EntityId>) -> ProcessingStats {
    let completed = completed_ids.len().min(total);
    ProcessingStats {
        total,
        completed,
        remaining: total.saturating_sub(completed_ids.len()),
    }
}

/// Per-entity resume decisions plus their summary
#[derive(Debug, Clone, Default)]
pub struct DownloadPlan {
    pub stats: ResumeStats,
    pub actions: HashMap<EntityId, ResumeAction>,
}

impl DownloadPlan {
    pub fn action(&self, id: &str) -> ResumeAction {
        self.actions.get(id).copied().unwrap_or(ResumeAction::Process)
    }
}

/// Decides what a resumed download stage redoes
#[derive(Debug, Clone)]
pub struct ResumeStateStore {
    artifact_dir: PathBuf,
    validator: Option<ArtifactValidator>,
}

impl ResumeStateStore {
    /// `validator` is `None` when prior artifacts are trusted as-is
    pub fn new(artifact_dir: impl Into<PathBuf>, validator: Option<ArtifactValidator>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            validator,
        }
    }

    /// Whether a prior artifact still validates
    pub fn artifact_is_valid(&self, prior: &PriorDownload) -> bool {
        let Some(validator) = &self.validator else {
            return true;
        };
        match &prior.artifact_file {
            Some(file) => validator.is_valid(&self.artifact_dir.join(file)),
            None => false,
        }
    }

    /// Decide for one entity
    pub fn action_for(&self, id: &str, prior: Option<&PriorDownload>) -> ResumeAction {
        let Some(prior) = prior else {
            return ResumeAction::Process;
        };
        if retry_decision(prior.outcome.as_ref()) {
            return ResumeAction::Retry { corrupted: false };
        }

        let has_artifact = prior.outcome.as_ref().map(|o| o.has_artifact()).unwrap_or(false);
        if has_artifact && !self.artifact_is_valid(prior) {
            tracing::warn!(entity = %id, "Prior artifact failed validation; scheduling re-fetch");
            return ResumeAction::Retry { corrupted: true };
        }
        ResumeAction::Skip
    }

    /// Decide for every current entity. Duplicate ids count once and prior
    /// rows for ids not in `ids` are ignored.
    pub fn plan_downloads<'a, I>(&self, ids: I, prior: &DownloadState) -> DownloadPlan
    where
        I: IntoIterator<Item = &'a EntityId>,
    {
        let mut plan = DownloadPlan::default();

        for id in ids {
            if plan.actions.contains_key(id) {
                continue;
            }
            let action = self.action_for(id, prior.get(id));
            plan.stats.total += 1;
            match action {
                ResumeAction::Skip => plan.stats.already_completed += 1,
                ResumeAction::Retry { corrupted } => {
                    plan.stats.failed += 1;
                    if corrupted {
                        plan.stats.corrupted += 1;
                    }
                }
                ResumeAction::Process => {}
            }
            plan.actions.insert(id.clone(), action);
        }

        plan.stats.remaining = plan.stats.total - plan.stats.already_completed - plan.stats.failed;
        plan
    }

    pub fn compute_download_stats<'a, I>(&self, ids: I, prior: &DownloadState) -> ResumeStats
    where
        I: IntoIterator<Item = &'a EntityId>,
    {
        self.plan_downloads(ids, prior).stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::validation::tests::TailTextExtractor;
    use std::sync::Arc;
    use tempfile::TempDir;

    const HEADER: &str = "EntityId,EntityName,FilingDate,Reference,ArtifactUrl,DownloadStatus,ArtifactFile,DownloadedAt\n";

    fn write_status(dir: &TempDir, rows: &[&str]) -> PathBuf {
        let path = dir.path().join("status.csv");
        let mut content = HEADER.to_string();
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn write_pdf(dir: &Path, name: &str, valid: bool) {
        let mut bytes = b"%PDF".to_vec();
        bytes.resize(if valid { 2048 } else { 100 }, b'x');
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    fn store(dir: &Path) -> ResumeStateStore {
        ResumeStateStore::new(dir, Some(ArtifactValidator::new(Arc::new(TailTextExtractor))))
    }

    fn ids(list: &[&str]) -> Vec<EntityId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_retry_decision() {
        assert!(retry_decision(Some(&DownloadOutcome::failed("timeout"))));
        assert!(retry_decision(Some(&DownloadOutcome::error("boom"))));
        assert!(retry_decision(Some(&DownloadOutcome::NotAttempted)));
        assert!(retry_decision(None));
        assert!(!retry_decision(Some(&DownloadOutcome::Success)));
        assert!(!retry_decision(Some(&DownloadOutcome::Skipped)));
        assert!(!retry_decision(Some(&DownloadOutcome::NoReference)));
        assert!(!retry_decision(Some(&DownloadOutcome::InvalidReference)));
    }

    #[test]
    fn test_absent_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        assert!(load_download_status(&dir.path().join("none.csv")).unwrap().is_empty());
        assert!(load_completed_ids(&dir.path().join("none.csv")).unwrap().is_empty());
    }

    #[test]
    fn test_load_status_last_row_wins_and_malformed_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_status(
            &dir,
            &[
                "1,A,,,u,FAILED: timeout,,",
                "2,B,,,u,SUCCESS,2_x.pdf,2024-01-01T00:00:00Z",
                "1,A,,,u,SUCCESS,1_x.pdf,2024-01-02T00:00:00Z",
                "3,C,,,u,DONE?,,",
                "4,D,,",
                ",E,,,u,SUCCESS,,",
            ],
        );

        let state = load_download_status(&path).unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state["1"].outcome, Some(DownloadOutcome::Success));
        assert_eq!(state["1"].artifact_file.as_deref(), Some("1_x.pdf"));
        assert_eq!(state["3"].outcome, None);
        assert_eq!(state["3"].artifact_file, None);
    }

    #[test]
    fn test_missing_status_column_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("odd.csv");
        std::fs::write(&path, "EntityId,Other\n1,x\n").unwrap();
        assert!(load_download_status(&path).unwrap().is_empty());

        std::fs::write(&path, "Id,Other\n1,x\n").unwrap();
        assert!(load_completed_ids(&path).unwrap().is_empty());
    }

    #[test]
    fn test_load_completed_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("done.csv");
        std::fs::write(&path, "EntityId,EntityName\n1,A\n2,B\n2,B\n").unwrap();

        let done = load_completed_ids(&path).unwrap();
        assert_eq!(done.len(), 2);

        let stats = compute_processing_stats(5, &done);
        assert_eq!(stats, ProcessingStats { total: 5, completed: 2, remaining: 3 });
        assert_eq!(compute_processing_stats(1, &done).remaining, 0);
    }

    #[test]
    fn test_download_stats_invariant_and_corruption() {
        let dir = TempDir::new().unwrap();
        write_pdf(dir.path(), "1_v.pdf", true);
        write_pdf(dir.path(), "2_v.pdf", false);

        let path = write_status(
            &dir,
            &[
                "1,A,,,u,SUCCESS,1_v.pdf,t",
                "2,B,,,u,SUCCESS,2_v.pdf,t",
                "3,C,,,u,FAILED: HTTP 503,,t",
                "4,D,,,u,NO_URL,,t",
                "5,E,,,u,WHATEVER,,t",
                "9,Z,,,u,SUCCESS,9_v.pdf,t",
            ],
        );
        let prior = load_download_status(&path).unwrap();
        let current = ids(&["1", "2", "3", "4", "5", "6", "7", "1"]);

        let plan = store(dir.path()).plan_downloads(&current, &prior);
        let stats = plan.stats;

        assert_eq!(stats.total, 7);
        assert_eq!(stats.already_completed, 2);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.corrupted, 1);
        assert_eq!(stats.remaining, 2);
        assert_eq!(stats.already_completed + stats.failed + stats.remaining, stats.total);
        assert_eq!(stats.to_process(), 5);

        assert_eq!(plan.action("1"), ResumeAction::Skip);
        assert_eq!(plan.action("2"), ResumeAction::Retry { corrupted: true });
        assert_eq!(plan.action("3"), ResumeAction::Retry { corrupted: false });
        assert_eq!(plan.action("4"), ResumeAction::Skip);
        assert_eq!(plan.action("5"), ResumeAction::Retry { corrupted: false });
        assert_eq!(plan.action("6"), ResumeAction::Process);
    }

    #[test]
    fn test_validation_disabled_trusts_prior_success() {
        let dir = TempDir::new().unwrap();
        let path = write_status(&dir, &["1,A,,,u,SUCCESS,gone.pdf,t"]);
        let prior = load_download_status(&path).unwrap();

        let trusting = ResumeStateStore::new(dir.path(), None);
        let stats = trusting.compute_download_stats(&ids(&["1"]), &prior);
        assert_eq!(stats.already_completed, 1);

        let checking = store(dir.path());
        let stats = checking.compute_download_stats(&ids(&["1"]), &prior);
        assert_eq!(stats.corrupted, 1);
        assert_eq!(stats.already_completed, 0);
    }
}
