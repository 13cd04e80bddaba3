//! Artifact analysis stage
//!
//! Produces the cumulative result file: one row per entity whose artifact
//! was downloaded and could be analyzed.

use chrono::{SecondsFormat, Utc};
use std::collections::HashSet;

use super::{StageEnv, StageError, StageMode, StageReport};
use crate::content::clean_text;
use crate::pipeline::context::Phase;
use crate::pipeline::progress::{StageProgress, Tally};
use crate::records::{extend_headers, RecordError, StageReader, StageWriter};
use crate::resume::{compute_processing_stats, load_completed_ids, COL_ARTIFACT_FILE, COL_DOWNLOAD_STATUS};
use crate::types::{DownloadOutcome, EntityId};

pub const COL_MATCHED_LABELS: &str = "MatchedLabels";
pub const COL_MATCH_COUNT: &str = "MatchCount";
pub const COL_TEXT_LENGTH: &str = "TextLength";
pub const COL_ANALYZED_AT: &str = "AnalyzedAt";

pub async fn analyze_artifacts(env: &StageEnv<'_>) -> Result<StageReport, StageError> {
    let phase = Phase::AnalyzingArtifacts;
    let input = &env.files.downloads;
    let output = &env.files.results;
    let mode = env.mode_for(output);

    if !input.exists() {
        return Err(StageError::MissingInput(input.clone()));
    }

    let mut reader = StageReader::open(input)?;
    let missing = |column: &str| RecordError::MissingColumn {
        path: input.clone(),
        column: column.to_string(),
    };
    let status_idx = reader
        .column_index(COL_DOWNLOAD_STATUS)
        .ok_or_else(|| missing(COL_DOWNLOAD_STATUS))?;
    let file_idx = reader
        .column_index(COL_ARTIFACT_FILE)
        .ok_or_else(|| missing(COL_ARTIFACT_FILE))?;
    let headers = extend_headers(
        reader.headers(),
        &[COL_MATCHED_LABELS, COL_MATCH_COUNT, COL_TEXT_LENGTH, COL_ANALYZED_AT],
    );

    let analyzable = analyzable_ids(input, status_idx)?;
    let (mut completed, mut writer) = match mode {
        StageMode::Resume => {
            let done = load_completed_ids(output)?;
            (done, StageWriter::append(output, &headers)?)
        }
        StageMode::Standard => (HashSet::new(), StageWriter::create(output, &headers)?),
    };

    let already: HashSet<EntityId> = completed.intersection(&analyzable).cloned().collect();
    let stats = compute_processing_stats(analyzable.len(), &already);
    if mode == StageMode::Resume {
        tracing::info!(
            "Resuming analysis: {} total, {} completed, {} remaining",
            stats.total,
            stats.completed,
            stats.remaining
        );
    }

    env.context.set_current_file(Some(output));
    let progress = StageProgress::new(phase, Some(stats.total as u64), env.quiet);

    for row in reader.rows() {
        if env.cancel.is_cancelled() {
            progress.abandon("Cancelled");
            return Err(StageError::Cancelled);
        }

        let row = match row {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("Skipping row in {}: {}", input.display(), e);
                continue;
            }
        };
        let id = &row.record.id;

        let has_artifact = row
            .fields
            .get(status_idx)
            .and_then(|s| s.parse::<DownloadOutcome>().ok())
            .map(|o| o.has_artifact())
            .unwrap_or(false);
        if !has_artifact {
            continue;
        }
        if completed.contains(id) {
            progress.record(id, Tally::Skipped);
            continue;
        }
        if !env.context.admit(id) {
            super::log_limit_reached(env);
            break;
        }

        let file_name = row
            .fields
            .get(file_idx)
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| row.record.artifact_file_name());
        let path = env.options().artifact_dir.join(&file_name);

        let text = match env.validator.validate_and_extract(&path) {
            Ok(text) => clean_text(&text),
            Err(rejection) => {
                tracing::warn!(entity = %id, "Cannot analyze {}: {}", file_name, rejection);
                progress.record(id, Tally::Failed);
                continue;
            }
        };

        let classification = env.collaborators.classifier.classify(&text, id);
        let analyzed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writer.write_row(
            &row.fields,
            &[
                &classification.labels_cell(),
                &classification.total_matches.to_string(),
                &text.chars().count().to_string(),
                &analyzed_at,
            ],
        )?;

        env.context.record_analyzed();
        completed.insert(id.clone());
        progress.record(id, Tally::Done);
    }

    writer.finish()?;
    progress.finish();

    let mut report = StageReport::new(phase, mode, output, progress.counts());
    report.processing = Some(stats);
    Ok(report)
}

/// Ids whose download status says an artifact exists
fn analyzable_ids(input: &std::path::Path, status_idx: usize) -> Result<HashSet<EntityId>, StageError> {
    let mut reader = StageReader::open(input)?;
    let ids = reader
        .rows()
        .flatten()
        .filter(|row| {
            row.fields
                .get(status_idx)
                .and_then(|s| s.parse::<DownloadOutcome>().ok())
                .map(|o| o.has_artifact())
                .unwrap_or(false)
        })
        .map(|row| row.record.id)
        .collect();
    Ok(ids)
}
