//! Artifact download stage
//!
//! Standard mode truncates the download-status file and writes one row per
//! reference. Resume mode treats the file as an append-only log: prior final
//! outcomes are skipped, only processed entities get a new row, and the log
//! is compacted to one row per entity when anything was appended.

use chrono::{SecondsFormat, Utc};
use url::Url;

use super::references::COL_ARTIFACT_URL;
use super::{fetch_was_cancelled, StageEnv, StageError, StageMode, StageReport};
use crate::fetching::FetchError;
use crate::pipeline::context::Phase;
use crate::pipeline::progress::{StageProgress, Tally};
use crate::records::{compact_by_id, extend_headers, RecordError, StageReader, StageWriter};
use crate::resume::{
    load_download_status, ResumeAction, ResumeStateStore, COL_ARTIFACT_FILE, COL_DOWNLOADED_AT,
    COL_DOWNLOAD_STATUS,
};
use crate::types::{DownloadOutcome, EntityId, EntityRecord};

pub async fn download_artifacts(env: &StageEnv<'_>) -> Result<StageReport, StageError> {
    let phase = Phase::DownloadingArtifacts;
    let input = &env.files.references;
    let output = &env.files.downloads;
    let mode = env.mode_for(output);

    if !input.exists() {
        return Err(StageError::MissingInput(input.clone()));
    }
    std::fs::create_dir_all(&env.options().artifact_dir)?;

    let ids = current_ids(input)?;
    let mut reader = StageReader::open(input)?;
    let url_idx = reader
        .column_index(COL_ARTIFACT_URL)
        .ok_or_else(|| RecordError::MissingColumn {
            path: input.clone(),
            column: COL_ARTIFACT_URL.to_string(),
        })?;
    let headers = extend_headers(
        reader.headers(),
        &[COL_DOWNLOAD_STATUS, COL_ARTIFACT_FILE, COL_DOWNLOADED_AT],
    );

    let (plan, mut writer) = match mode {
        StageMode::Resume => {
            let prior = load_download_status(output)?;
            let validator = env
                .options()
                .validate_artifacts
                .then(|| env.validator.clone());
            let store = ResumeStateStore::new(&env.options().artifact_dir, validator);
            let plan = store.plan_downloads(&ids, &prior);

            let stats = &plan.stats;
            tracing::info!(
                "Resuming downloads: {} total, {} completed, {} to retry ({} corrupted), {} remaining",
                stats.total,
                stats.already_completed,
                stats.failed,
                stats.corrupted,
                stats.remaining
            );
            (Some(plan), StageWriter::append(output, &headers)?)
        }
        StageMode::Standard => (None, StageWriter::create(output, &headers)?),
    };

    env.context.set_current_file(Some(output));
    let progress = StageProgress::new(phase, Some(ids.len() as u64), env.quiet);

    for row in reader.rows() {
        if env.cancel.is_cancelled() {
            progress.abandon("Cancelled");
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
        let id = row.record.id.clone();

        let action = plan
            .as_ref()
            .map(|p| p.action(&id))
            .unwrap_or(ResumeAction::Process);
        if action == ResumeAction::Skip {
            progress.record(&id, Tally::Skipped);
            continue;
        }
        if !env.context.admit(&id) {
            super::log_limit_reached(env);
            break;
        }

        let raw_url = row.fields.get(url_idx).unwrap_or_default();
        let (outcome, artifact_file) = match download_one(env, &row.record, raw_url).await {
            Ok(result) => result,
            Err(e) => {
                progress.abandon("Cancelled");
                return Err(e);
            }
        };

        let downloaded_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writer.write_row(
            &row.fields,
            &[
                &outcome.to_string(),
                artifact_file.as_deref().unwrap_or_default(),
                &downloaded_at,
            ],
        )?;

        let tally = match &outcome {
            DownloadOutcome::Success => {
                env.context.record_download_success();
                Tally::Done
            }
            o if o.is_failure() => {
                env.context.record_download_failure();
                Tally::Failed
            }
            _ => Tally::Skipped,
        };
        progress.record(&id, tally);
    }

    let appended = writer.finish()?;
    progress.finish();

    if mode == StageMode::Resume && appended > 0 {
        let compacted = compact_by_id(output, &ids)?;
        tracing::info!(
            "Compacted {}: {} row(s) -> {}",
            output.display(),
            compacted.rows_read,
            compacted.rows_kept
        );
    }

    let mut report = StageReport::new(phase, mode, output, progress.counts());
    report.resume = plan.map(|p| p.stats);
    Ok(report)
}

/// Ids in the reference file, in order, without duplicates
fn current_ids(input: &std::path::Path) -> Result<Vec<EntityId>, StageError> {
    let mut reader = StageReader::open(input)?;
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for row in reader.rows().flatten() {
        if seen.insert(row.record.id.clone()) {
            ids.push(row.record.id);
        }
    }
    Ok(ids)
}

/// Decide the outcome for one entity. Only cancellation is an error.
async fn download_one(
    env: &StageEnv<'_>,
    record: &EntityRecord,
    raw_url: &str,
) -> Result<(DownloadOutcome, Option<String>), StageError> {
    let raw_url = raw_url.trim();
    if raw_url.is_empty() {
        tracing::info!(entity = %record.id, "No artifact reference");
        return Ok((DownloadOutcome::NoReference, None));
    }

    let url = match Url::parse(raw_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => {
            tracing::warn!(entity = %record.id, "Invalid artifact URL {:?}", raw_url);
            return Ok((DownloadOutcome::InvalidReference, None));
        }
    };

    let file_name = record.artifact_file_name();
    let dest = env.options().artifact_dir.join(&file_name);

    if dest.exists() && env.validator.is_valid(&dest) {
        tracing::debug!(entity = %record.id, "Artifact already on disk: {}", dest.display());
        return Ok((DownloadOutcome::Skipped, Some(file_name)));
    }

    match env.fetch(&record.id, &url, &dest).await {
        Ok(_) => match env.validator.validate(&dest) {
            Ok(()) => {
                tracing::debug!(entity = %record.id, "Downloaded {}", file_name);
                Ok((DownloadOutcome::Success, Some(file_name)))
            }
            Err(rejection) => {
                tracing::warn!(entity = %record.id, "Downloaded artifact rejected: {}", rejection);
                Ok((DownloadOutcome::failed(rejection), None))
            }
        },
        Err(e) if fetch_was_cancelled(&e, env.cancel) => Err(StageError::Cancelled),
        Err(e) => {
            let outcome = match e.into_inner() {
                Some(FetchError::Io(io)) => DownloadOutcome::error(io),
                Some(other) => DownloadOutcome::failed(other),
                None => DownloadOutcome::failed("unknown error"),
            };
            tracing::warn!(entity = %record.id, "Download failed: {}", outcome);
            Ok((outcome, None))
        }
    }
}
