//! Feed download and parse stages

use url::Url;

use super::{discard, fetch_was_cancelled, StageEnv, StageError, StageMode, StageReport};
use crate::pipeline::context::Phase;
use crate::pipeline::progress::{StageProgress, Tally};
use crate::records::{commit, record_fields, record_headers, temp_path, StageWriter};

/// Obtain the feed file, from the configured local path or by fetching it
pub async fn download_feed(env: &StageEnv<'_>) -> Result<StageReport, StageError> {
    let phase = Phase::DownloadingFeed;
    let dest = &env.files.feed;

    if env.config.feed.local_path.is_some() {
        if !dest.exists() {
            return Err(StageError::MissingInput(dest.clone()));
        }
        tracing::info!("Using local feed {}", dest.display());
        return Ok(StageReport::reused(phase, StageMode::Standard, dest));
    }

    let mode = env.mode_for(dest);
    let non_empty = std::fs::metadata(dest).map(|m| m.len() > 0).unwrap_or(false);
    if mode == StageMode::Resume && non_empty {
        tracing::info!("Reusing downloaded feed {}", dest.display());
        return Ok(StageReport::reused(phase, mode, dest));
    }

    let raw = env
        .config
        .feed
        .url
        .as_deref()
        .ok_or_else(|| StageError::Config("no feed url or local_path configured".to_string()))?;
    let url = Url::parse(raw).map_err(|e| StageError::Config(format!("invalid feed url '{}': {}", raw, e)))?;

    env.context.set_current_file(Some(dest));
    tracing::info!("Downloading feed from {}", url);

    match env.fetch("feed", &url, dest).await {
        Ok(artifact) => {
            tracing::info!(
                "Downloaded feed ({} bytes) in {:?}",
                artifact.bytes,
                artifact.fetch_duration
            );
            Ok(StageReport::new(phase, mode, dest, Default::default()))
        }
        Err(e) if fetch_was_cancelled(&e, env.cancel) => Err(StageError::Cancelled),
        Err(e) => Err(StageError::FeedDownload(e.to_string())),
    }
}

/// Parse the feed into the parsed-records file
pub async fn parse_feed(env: &StageEnv<'_>) -> Result<StageReport, StageError> {
    let phase = Phase::ParsingFeed;
    let output = &env.files.parsed;
    let mode = env.mode_for(output);

    if mode == StageMode::Resume {
        tracing::info!("Reusing parsed feed {}", output.display());
        return Ok(StageReport::reused(phase, mode, output));
    }

    let attributes = &env.config.feed.attributes;
    let stream = env.collaborators.feed_parser.parse(&env.files.feed)?;

    let temp = temp_path(output);
    env.context.set_current_file(Some(&temp));
    let mut writer = StageWriter::create(&temp, &record_headers(attributes))?;
    let progress = StageProgress::new(phase, None, env.quiet);

    for item in stream {
        if env.cancel.is_cancelled() {
            progress.abandon("Cancelled");
            drop(writer);
            discard(&temp);
            return Err(StageError::Cancelled);
        }

        match item {
            Ok(record) => {
                if let Err(e) = writer.write_record(&record_fields(&record, attributes)) {
                    drop(writer);
                    discard(&temp);
                    return Err(e.into());
                }
                progress.record(&record.id, Tally::Done);
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!("Skipping feed record: {}", e);
                progress.record("-", Tally::Failed);
            }
            Err(e) => {
                progress.abandon("Feed error");
                drop(writer);
                discard(&temp);
                return Err(e.into());
            }
        }
    }

    let written = writer.finish()?;
    commit(&temp, output)?;
    progress.finish();
    tracing::info!("Parsed {} record(s) into {}", written, output.display());

    Ok(StageReport::new(phase, mode, output, progress.counts()))
}
