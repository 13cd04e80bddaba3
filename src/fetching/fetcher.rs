//! HTTP artifact fetcher
//!
//! Downloads a URL to a local file. The body is streamed into a `.part` file
//! next to the destination and renamed into place only once complete, so a
//! crash never leaves a truncated artifact under its final name.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::retry::{classify_io, classify_message, Classify, FailureClass};

/// Errors that can occur while fetching an artifact
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Missing value: {0}")]
    MissingValue(String),
    #[error("Content too large: {0} bytes")]
    ContentTooLarge(u64),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Fetch cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl Classify for FetchError {
    fn failure_class(&self) -> FailureClass {
        if self.to_string().to_lowercase().contains("non-transient") {
            return FailureClass::NonTransient;
        }

        match self {
            FetchError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    return FailureClass::Transient;
                }
                match e.status() {
                    Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                        FailureClass::Transient
                    }
                    Some(_) => FailureClass::NonTransient,
                    None => classify_message(&e.to_string()),
                }
            }
            FetchError::Status { status, .. } => {
                if *status >= 500 || *status == 429 || *status == 408 {
                    FailureClass::Transient
                } else {
                    FailureClass::NonTransient
                }
            }
            FetchError::Io(e) => classify_io(e),
            FetchError::Timeout(_) => FailureClass::Transient,
            FetchError::ContentTooLarge(_) | FetchError::InvalidUrl(_) | FetchError::Cancelled => {
                FailureClass::NonTransient
            }
            FetchError::Other(message) => classify_message(message),
            // Argument and missing-value errors never heal on retry
            FetchError::InvalidArgument(_) | FetchError::MissingValue(_) => FailureClass::NonTransient,
        }
    }
}

/// A fetched artifact on local disk
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    /// Final local path
    pub path: PathBuf,
    /// Bytes written
    pub bytes: u64,
    /// Content type reported by the server
    pub content_type: Option<String>,
    /// Time taken to fetch
    pub fetch_duration: Duration,
}

/// Downloads a URL to a local file
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, dest: &Path) -> Result<FetchedArtifact, FetchError>;
}

/// Configuration for the HTTP fetcher
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string
    pub user_agent: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum response size (bytes)
    pub max_content_size: u64,
    /// Maximum redirects to follow
    pub max_redirects: usize,
    /// Idle connections kept per host
    pub connections_per_host: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_content_size: 500 * 1024 * 1024, // feeds can be large
            max_redirects: 10,
            connections_per_host: 4,
        }
    }
}

/// Fetch statistics
#[derive(Debug, Clone, Default)]
pub struct FetchStats {
    pub total_fetches: u64,
    pub successes: u64,
    pub failures: u64,
    pub bytes_downloaded: u64,
}

/// reqwest-backed fetcher
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
    config: FetchConfig,
    total_fetches: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl HttpArtifactFetcher {
    /// Create a new fetcher
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.connections_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            config,
            total_fetches: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
        })
    }

    /// Get fetch statistics
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            total_fetches: self.total_fetches.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    async fn fetch_to_file(&self, url: &Url, dest: &Path) -> Result<FetchedArtifact, FetchError> {
        let start = Instant::now();

        let mut response = self.client.get(url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        if let Some(len) = response.content_length() {
            if len > self.config.max_content_size {
                return Err(FetchError::ContentTooLarge(len));
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part_path = part_path(dest);
        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut written: u64 = 0;

        let body_result: Result<(), FetchError> = async {
            while let Some(chunk) = response.chunk().await? {
                written += chunk.len() as u64;
                if written > self.config.max_content_size {
                    return Err(FetchError::ContentTooLarge(written));
                }
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        drop(file);

        if let Err(e) = body_result {
            if let Err(cleanup) = tokio::fs::remove_file(&part_path).await {
                tracing::debug!("Failed to remove partial file {}: {}", part_path.display(), cleanup);
            }
            return Err(e);
        }

        tokio::fs::rename(&part_path, dest).await?;

        Ok(FetchedArtifact {
            path: dest.to_path_buf(),
            bytes: written,
            content_type,
            fetch_duration: start.elapsed(),
        })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &Url, dest: &Path) -> Result<FetchedArtifact, FetchError> {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);

        if url.scheme() != "http" && url.scheme() != "https" {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(FetchError::InvalidArgument(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        match self.fetch_to_file(url, dest).await {
            Ok(artifact) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.bytes_downloaded.fetch_add(artifact.bytes, Ordering::Relaxed);
                tracing::debug!(
                    "Fetched {} ({} bytes) in {:?}",
                    url,
                    artifact.bytes,
                    artifact.fetch_duration
                );
                Ok(artifact)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Temporary path used while a download is in flight
fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let server = FetchError::Status {
            status: 503,
            url: "https://example.com/a.pdf".to_string(),
        };
        assert_eq!(server.failure_class(), FailureClass::Transient);

        let throttled = FetchError::Status {
            status: 429,
            url: "https://example.com/a.pdf".to_string(),
        };
        assert_eq!(throttled.failure_class(), FailureClass::Transient);

        let missing = FetchError::Status {
            status: 404,
            url: "https://example.com/a.pdf".to_string(),
        };
        assert_eq!(missing.failure_class(), FailureClass::NonTransient);
    }

    #[test]
    fn test_argument_errors_never_transient() {
        let err = FetchError::InvalidArgument("connection string was empty".to_string());
        assert_eq!(err.failure_class(), FailureClass::NonTransient);

        let err = FetchError::MissingValue("socket address".to_string());
        assert_eq!(err.failure_class(), FailureClass::NonTransient);
    }

    #[test]
    fn test_message_override() {
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(1)).failure_class(),
            FailureClass::Transient
        );
        assert_eq!(
            FetchError::Other("network glitch".to_string()).failure_class(),
            FailureClass::Transient
        );
        assert_eq!(
            FetchError::Other("non-transient network glitch".to_string()).failure_class(),
            FailureClass::NonTransient
        );
        assert_eq!(
            FetchError::ContentTooLarge(10).failure_class(),
            FailureClass::NonTransient
        );
    }

    #[test]
    fn test_part_path() {
        let dest = Path::new("/data/artifacts/100_884512.pdf");
        assert_eq!(
            part_path(dest),
            PathBuf::from("/data/artifacts/100_884512.pdf.part")
        );
    }

    #[tokio::test]
    async fn test_rejects_unsupported_scheme() {
        let fetcher = HttpArtifactFetcher::new(FetchConfig::default()).unwrap();
        let url = Url::parse("ftp://example.com/file.pdf").unwrap();
        let dir = tempfile::TempDir::new().unwrap();

        let result = fetcher.fetch(&url, &dir.path().join("file.pdf")).await;
        assert!(matches!(result, Err(FetchError::InvalidArgument(_))));
        assert_eq!(fetcher.stats().failures, 1);
    }
}
