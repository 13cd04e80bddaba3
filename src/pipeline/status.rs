//! Read-only view of a run's progress on disk

use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use super::context::RunOptions;
use super::stages::StageFiles;
use crate::config::Config;
use crate::content::TextExtractor;
use crate::records::StageReader;
use crate::resume::{
    compute_processing_stats, load_completed_ids, load_download_status, ArtifactValidator,
    ProcessingStats, ResumeStateStore, ResumeStats,
};
use crate::types::{DownloadOutcome, EntityId};

/// Existence and size of one stage file
#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub rows: Option<usize>,
}

/// What a resumed run would find
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub date_token: String,
    pub files: Vec<FileStatus>,
    pub downloads: Option<ResumeStats>,
    pub analysis: Option<ProcessingStats>,
}

/// Inspect the stage files of the run `config` points at
pub fn inspect(config: &Config, extractor: Arc<dyn TextExtractor>) -> anyhow::Result<StatusReport> {
    let options = RunOptions::from_config(config);
    let files = StageFiles::new(&options, &config.feed);

    let file_status = [&files.parsed, &files.references, &files.downloads, &files.results]
        .into_iter()
        .map(|path| FileStatus {
            path: path.clone(),
            exists: path.exists(),
            rows: count_rows(path),
        })
        .collect();

    let mut report = StatusReport {
        date_token: options.date_token.clone(),
        files: file_status,
        downloads: None,
        analysis: None,
    };

    if files.references.exists() {
        let ids = ids_in(&files.references)?;
        let prior = load_download_status(&files.downloads)?;
        let validator = options
            .validate_artifacts
            .then(|| ArtifactValidator::from_config(&config.validation, extractor));
        let store = ResumeStateStore::new(&options.artifact_dir, validator);
        report.downloads = Some(store.compute_download_stats(&ids, &prior));
    }

    if files.downloads.exists() {
        let analyzable: HashSet<EntityId> = load_download_status(&files.downloads)?
            .into_iter()
            .filter(|(_, prior)| prior.outcome.as_ref().map(DownloadOutcome::has_artifact).unwrap_or(false))
            .map(|(id, _)| id)
            .collect();
        let done: HashSet<EntityId> = load_completed_ids(&files.results)?
            .intersection(&analyzable)
            .cloned()
            .collect();
        report.analysis = Some(compute_processing_stats(analyzable.len(), &done));
    }

    Ok(report)
}

fn ids_in(path: &std::path::Path) -> anyhow::Result<Vec<EntityId>> {
    let mut reader = StageReader::open(path)?;
    Ok(reader.rows().flatten().map(|row| row.record.id).collect())
}

fn count_rows(path: &std::path::Path) -> Option<usize> {
    let mut reader = StageReader::open(path).ok()?;
    Some(reader.rows().count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::validation::tests::TailTextExtractor;
    use tempfile::TempDir;

    #[test]
    fn test_status_of_partial_run() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.run.output_dir = dir.path().to_path_buf();
        config.run.artifact_dir = dir.path().join("artifacts");
        config.run.date_token = Some("20240115".to_string());
        config.validation.enabled = false;

        let options = RunOptions::from_config(&config);
        let files = StageFiles::new(&options, &config.feed);
        std::fs::write(
            &files.references,
            "EntityId,EntityName,FilingDate,Reference,ArtifactUrl\n1,A,,,u\n2,B,,,u\n3,C,,,u\n",
        )
        .unwrap();
        std::fs::write(
            &files.downloads,
            "EntityId,EntityName,FilingDate,Reference,ArtifactUrl,DownloadStatus,ArtifactFile,DownloadedAt\n\
             1,A,,,u,SUCCESS,1_a.pdf,t\n\
             2,B,,,u,FAILED: HTTP 500,,t\n",
        )
        .unwrap();

        let report = inspect(&config, Arc::new(TailTextExtractor)).unwrap();
        assert_eq!(report.date_token, "20240115");

        let downloads = report.downloads.unwrap();
        assert_eq!(downloads.total, 3);
        assert_eq!(downloads.already_completed, 1);
        assert_eq!(downloads.failed, 1);
        assert_eq!(downloads.remaining, 1);

        let analysis = report.analysis.unwrap();
        assert_eq!(analysis, ProcessingStats { total: 1, completed: 0, remaining: 1 });

        assert!(!report.files[0].exists);
        assert_eq!(report.files[1].rows, Some(3));
    }
}
