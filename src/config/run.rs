//! Run layout and feed configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a run reads and writes, and how much of the feed it covers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory for the feed and all stage files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory for fetched artifacts
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Base name for stage files (`<base>_<token>.csv`)
    #[serde(default = "default_base_name")]
    pub base_name: String,
    /// Stop after this many entities have been emitted
    #[serde(default)]
    pub index_limit: Option<u64>,
    /// Reuse existing stage outputs
    #[serde(default)]
    pub resume: bool,
    /// Date token for file names; today's UTC date when unset
    #[serde(default)]
    pub date_token: Option<String>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("output/artifacts")
}

fn default_base_name() -> String {
    "filings".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            artifact_dir: default_artifact_dir(),
            base_name: default_base_name(),
            index_limit: None,
            resume: false,
            date_token: None,
        }
    }
}

/// Feed source and record layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Remote feed location
    #[serde(default)]
    pub url: Option<String>,
    /// Local feed file; takes precedence over `url`
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Element that holds one entity
    #[serde(default = "default_record_element")]
    pub record_element: String,
    #[serde(default = "default_id_attribute")]
    pub id_attribute: String,
    #[serde(default = "default_name_attribute")]
    pub name_attribute: String,
    #[serde(default = "default_date_attribute")]
    pub date_attribute: String,
    #[serde(default = "default_reference_attribute")]
    pub reference_attribute: String,
    /// Extra attributes copied into the parsed file, one column each
    #[serde(default = "default_attributes")]
    pub attributes: Vec<String>,
    /// Template that turns a bare version id into an artifact URL.
    /// Placeholders: `{id}` and `{reference}`.
    #[serde(default = "default_artifact_url_template")]
    pub artifact_url_template: String,
}

fn default_record_element() -> String {
    "Firm".to_string()
}

fn default_id_attribute() -> String {
    "FirmCrdNb".to_string()
}

fn default_name_attribute() -> String {
    "BusNm".to_string()
}

fn default_date_attribute() -> String {
    "FilingDt".to_string()
}

fn default_reference_attribute() -> String {
    "BrochureId".to_string()
}

fn default_attributes() -> Vec<String> {
    vec!["City".to_string(), "State".to_string()]
}

fn default_artifact_url_template() -> String {
    "https://files.example.org/brochures/{id}/{reference}.pdf".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            local_path: None,
            record_element: default_record_element(),
            id_attribute: default_id_attribute(),
            name_attribute: default_name_attribute(),
            date_attribute: default_date_attribute(),
            reference_attribute: default_reference_attribute(),
            attributes: default_attributes(),
            artifact_url_template: default_artifact_url_template(),
        }
    }
}

impl FeedConfig {
    /// File name the downloaded feed is stored under
    pub fn file_name(&self) -> String {
        self.url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "feed.xml".to_string())
    }
}
