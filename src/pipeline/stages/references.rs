//! Reference extraction stage
//!
//! Applies the incremental diff and the index limit, and resolves each
//! record's reference to the URL its artifact is fetched from.

use super::{discard, StageEnv, StageError, StageMode, StageReport};
use crate::incremental::{Baseline, IncrementalDiffEngine, IncrementalStats};
use crate::pipeline::context::Phase;
use crate::pipeline::progress::{StageProgress, Tally};
use crate::records::{commit, extend_headers, temp_path, StageReader, StageWriter};
use crate::types::EntityRecord;

pub const COL_ARTIFACT_URL: &str = "ArtifactUrl";

/// Artifact URL for a record. Bare version ids expand through `template`
/// (`{id}`, `{reference}`); URLs and anything else pass through unchanged
/// so the download stage can judge them. No reference gives an empty string.
pub fn resolve_artifact_url(record: &EntityRecord, template: &str) -> String {
    let Some(reference) = record.reference.as_deref().map(str::trim).filter(|r| !r.is_empty()) else {
        return String::new();
    };

    let is_bare_id = reference
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if is_bare_id {
        template.replace("{id}", &record.id).replace("{reference}", reference)
    } else {
        reference.to_string()
    }
}

pub async fn extract_references(env: &StageEnv<'_>) -> Result<StageReport, StageError> {
    let phase = Phase::ExtractingReferences;
    let input = &env.files.parsed;
    let output = &env.files.references;
    let mode = env.mode_for(output);

    if mode == StageMode::Resume {
        tracing::info!("Reusing reference file {}", output.display());
        return Ok(StageReport::reused(phase, mode, output));
    }
    if !input.exists() {
        return Err(StageError::MissingInput(input.clone()));
    }

    let engine = if env.options().incremental {
        let path = env
            .options()
            .baseline_path
            .as_deref()
            .ok_or_else(|| StageError::Config("incremental run without a baseline_path".to_string()))?;
        let incremental = &env.config.incremental;
        let baseline = Baseline::load(path, &incremental.id_column, &incremental.date_column)?;
        Some(IncrementalDiffEngine::new(baseline))
    } else {
        None
    };

    let mut reader = StageReader::open(input)?;
    let headers = extend_headers(reader.headers(), &[COL_ARTIFACT_URL]);
    let template = &env.config.feed.artifact_url_template;

    let temp = temp_path(output);
    env.context.set_current_file(Some(&temp));
    let mut writer = StageWriter::create(&temp, &headers)?;
    let progress = StageProgress::new(phase, None, env.quiet);
    let mut diff_stats = IncrementalStats::default();

    for row in reader.rows() {
        if env.cancel.is_cancelled() {
            progress.abandon("Cancelled");
            drop(writer);
            discard(&temp);
            return Err(StageError::Cancelled);
        }

        let row = match row {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("Skipping row in {}: {}", input.display(), e);
                progress.record("-", Tally::Failed);
                continue;
            }
        };
        let record = &row.record;

        if let Some(engine) = &engine {
            let decision = engine.decide(&record.id, record.filing_date.as_deref());
            diff_stats.record(decision);
            if !decision.should_process() {
                tracing::debug!(entity = %record.id, "Unchanged since baseline");
                progress.record(&record.id, Tally::Skipped);
                continue;
            }
        }

        if !env.context.admit(&record.id) {
            super::log_limit_reached(env);
            break;
        }

        let url = resolve_artifact_url(record, template);
        if let Err(e) = writer.write_row(&row.fields, &[&url]) {
            drop(writer);
            discard(&temp);
            return Err(e.into());
        }
        progress.record(&record.id, Tally::Done);
    }

    let written = writer.finish()?;
    commit(&temp, output)?;
    progress.finish();
    tracing::info!("Wrote {} reference(s) to {}", written, output.display());

    let mut report = StageReport::new(phase, mode, output, progress.counts());
    if engine.is_some() {
        report.incremental = Some(diff_stats);
    }
    Ok(report)
}
