//! Core types shared by every pipeline stage

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Stable identifier of a feed entity
pub type EntityId = String;

/// One row of the external feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Stable identifier within the feed
    pub id: EntityId,
    /// Display name
    pub name: String,
    /// Filing/version date as published (`MM/DD/YYYY`)
    pub filing_date: Option<String>,
    /// Reference to the external document (URL or version id)
    pub reference: Option<String>,
    /// Remaining feed attributes, ordered by name
    pub attributes: BTreeMap<String, String>,
}

impl EntityRecord {
    /// Create a record with an id and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            filing_date: None,
            reference: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Set the filing date
    pub fn with_filing_date(mut self, date: impl Into<String>) -> Self {
        self.filing_date = Some(date.into());
        self
    }

    /// Set the document reference
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get an attribute value
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str())
    }

    /// Version component used to key downloaded artifacts.
    ///
    /// A bare alphanumeric reference is itself the version id. For URLs the
    /// first query value wins, then the last path segment without extension.
    /// Otherwise the filing date is used, and finally `"latest"`.
    pub fn version_id(&self) -> String {
        let reference = self.reference.as_deref().map(str::trim).unwrap_or_default();

        if !reference.is_empty() {
            if reference.chars().all(|c| c.is_ascii_alphanumeric()) {
                return reference.to_string();
            }
            if let Ok(url) = url::Url::parse(reference) {
                if let Some((_, value)) = url.query_pairs().next() {
                    let cleaned = sanitize_component(&value);
                    if !cleaned.is_empty() {
                        return cleaned;
                    }
                }
                if let Some(segment) = url
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .filter(|s| !s.is_empty())
                {
                    let stem = segment.rsplit_once('.').map(|(s, _)| s).unwrap_or(segment);
                    let cleaned = sanitize_component(stem);
                    if !cleaned.is_empty() {
                        return cleaned;
                    }
                }
            }
        }

        match self.filing_date.as_deref() {
            Some(date) if !date.trim().is_empty() => sanitize_component(date),
            _ => "latest".to_string(),
        }
    }

    /// File name of the artifact for this record, keyed by `(id, version)`
    pub fn artifact_file_name(&self) -> String {
        format!("{}_{}.pdf", sanitize_component(&self.id), self.version_id())
    }
}

/// Replace anything that is not safe in a file name
fn sanitize_component(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Outcome of the artifact download stage for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadOutcome {
    NotAttempted,
    Success,
    Failed(String),
    Error(String),
    Skipped,
    NoReference,
    InvalidReference,
}

impl DownloadOutcome {
    const NOT_ATTEMPTED: &'static str = "NOT_ATTEMPTED";
    const SUCCESS: &'static str = "SUCCESS";
    const FAILED: &'static str = "FAILED";
    const ERROR: &'static str = "ERROR";
    const SKIPPED: &'static str = "SKIPPED";
    const NO_URL: &'static str = "NO_URL";
    const INVALID_URL: &'static str = "INVALID_URL";

    /// Build a `Failed` outcome, flattening the reason onto one line
    pub fn failed(reason: impl fmt::Display) -> Self {
        DownloadOutcome::Failed(single_line(&reason.to_string()))
    }

    /// Build an `Error` outcome, flattening the reason onto one line
    pub fn error(reason: impl fmt::Display) -> Self {
        DownloadOutcome::Error(single_line(&reason.to_string()))
    }

    /// Whether an artifact should exist on disk for this outcome
    pub fn has_artifact(&self) -> bool {
        matches!(self, DownloadOutcome::Success | DownloadOutcome::Skipped)
    }

    /// Whether the outcome counts as a failed download
    pub fn is_failure(&self) -> bool {
        matches!(self, DownloadOutcome::Failed(_) | DownloadOutcome::Error(_))
    }
}

fn single_line(reason: &str) -> String {
    reason.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadOutcome::NotAttempted => f.write_str(Self::NOT_ATTEMPTED),
            DownloadOutcome::Success => f.write_str(Self::SUCCESS),
            DownloadOutcome::Failed(reason) if reason.is_empty() => f.write_str(Self::FAILED),
            DownloadOutcome::Failed(reason) => write!(f, "{}: {}", Self::FAILED, reason),
            DownloadOutcome::Error(reason) if reason.is_empty() => f.write_str(Self::ERROR),
            DownloadOutcome::Error(reason) => write!(f, "{}: {}", Self::ERROR, reason),
            DownloadOutcome::Skipped => f.write_str(Self::SKIPPED),
            DownloadOutcome::NoReference => f.write_str(Self::NO_URL),
            DownloadOutcome::InvalidReference => f.write_str(Self::INVALID_URL),
        }
    }
}

/// Error returned when a status column holds an unknown tag
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized download status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for DownloadOutcome {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (tag, reason) = match trimmed.split_once(':') {
            Some((tag, reason)) => (tag.trim(), reason.trim().to_string()),
            None => (trimmed, String::new()),
        };

        match tag.to_ascii_uppercase().as_str() {
            Self::NOT_ATTEMPTED => Ok(DownloadOutcome::NotAttempted),
            Self::SUCCESS => Ok(DownloadOutcome::Success),
            Self::FAILED => Ok(DownloadOutcome::Failed(reason)),
            Self::ERROR => Ok(DownloadOutcome::Error(reason)),
            Self::SKIPPED => Ok(DownloadOutcome::Skipped),
            Self::NO_URL => Ok(DownloadOutcome::NoReference),
            Self::INVALID_URL => Ok(DownloadOutcome::InvalidReference),
            _ => Err(UnknownStatus(trimmed.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_tags() {
        assert_eq!(DownloadOutcome::Success.to_string(), "SUCCESS");
        assert_eq!(DownloadOutcome::NoReference.to_string(), "NO_URL");
        assert_eq!(
            DownloadOutcome::failed("connection\nreset by peer").to_string(),
            "FAILED: connection reset by peer"
        );
        assert_eq!(DownloadOutcome::Error(String::new()).to_string(), "ERROR");
    }

    #[test]
    fn test_outcome_parsing() {
        assert_eq!("SUCCESS".parse(), Ok(DownloadOutcome::Success));
        assert_eq!(" skipped ".parse(), Ok(DownloadOutcome::Skipped));
        assert_eq!(
            "FAILED: HTTP 404".parse(),
            Ok(DownloadOutcome::Failed("HTTP 404".to_string()))
        );
        assert_eq!("ERROR".parse(), Ok(DownloadOutcome::Error(String::new())));
        assert_eq!("INVALID_URL".parse(), Ok(DownloadOutcome::InvalidReference));
        assert!("DONE".parse::<DownloadOutcome>().is_err());
        assert!("".parse::<DownloadOutcome>().is_err());
    }

    #[test]
    fn test_version_id() {
        let numeric = EntityRecord::new("100", "Acme").with_reference("884512");
        assert_eq!(numeric.version_id(), "884512");
        assert_eq!(numeric.artifact_file_name(), "100_884512.pdf");

        let url = EntityRecord::new("101", "Beta")
            .with_reference("https://files.example.com/docs/brochure-77.pdf");
        assert_eq!(url.version_id(), "brochure-77");

        let query = EntityRecord::new("102", "Gamma")
            .with_reference("https://files.example.com/fetch?BRCHR_VRSN_ID=991");
        assert_eq!(query.version_id(), "991");

        let dated = EntityRecord::new("103", "Delta").with_filing_date("01/15/2024");
        assert_eq!(dated.version_id(), "01_15_2024");

        assert_eq!(EntityRecord::new("104", "Eps").version_id(), "latest");
    }
}
