//! Artifact validation
//!
//! A prior `SUCCESS` is only trusted if its artifact still looks like a real
//! document: present, large enough, PDF signature at offset 0, and at least
//! some extractable text.

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ValidationConfig;
use crate::content::{TextExtractor, PDF_SIGNATURE};

/// Why an artifact was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactRejection {
    #[error("artifact is missing")]
    Missing,

    #[error("artifact is {size} bytes, below the {min} byte minimum")]
    TooSmall { size: u64, min: u64 },

    #[error("artifact does not start with the %PDF signature")]
    BadSignature,

    #[error("no text could be extracted: {0}")]
    NoText(String),

    #[error("artifact could not be read: {0}")]
    Unreadable(String),
}

/// Checks artifacts on disk before they are trusted or analyzed
#[derive(Clone)]
pub struct ArtifactValidator {
    min_size: u64,
    require_text: bool,
    extractor: Arc<dyn TextExtractor>,
}

impl std::fmt::Debug for ArtifactValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactValidator")
            .field("min_size", &self.min_size)
            .field("require_text", &self.require_text)
            .finish()
    }
}

impl ArtifactValidator {
    pub const DEFAULT_MIN_SIZE: u64 = 1024;

    pub fn new(extractor: Arc<dyn TextExtractor>) -> Self {
        Self {
            min_size: Self::DEFAULT_MIN_SIZE,
            require_text: true,
            extractor,
        }
    }

    pub fn from_config(config: &ValidationConfig, extractor: Arc<dyn TextExtractor>) -> Self {
        Self {
            min_size: config.min_size,
            require_text: config.require_text,
            extractor,
        }
    }

    /// Validate the artifact at `path`, logging the reason on rejection
    pub fn validate(&self, path: &Path) -> Result<(), ArtifactRejection> {
        let bytes = self.check_bytes(path)?;
        if self.require_text {
            self.extract(path, &bytes)?;
        }
        Ok(())
    }

    pub fn is_valid(&self, path: &Path) -> bool {
        self.validate(path).is_ok()
    }

    /// Validate and return the extracted text in one pass
    pub fn validate_and_extract(&self, path: &Path) -> Result<String, ArtifactRejection> {
        let bytes = self.check_bytes(path)?;
        self.extract(path, &bytes)
    }

    fn check_bytes(&self, path: &Path) -> Result<Vec<u8>, ArtifactRejection> {
        let result = self.read_checked(path);
        if let Err(reason) = &result {
            tracing::warn!("Rejected artifact {}: {}", path.display(), reason);
        }
        result
    }

    fn read_checked(&self, path: &Path) -> Result<Vec<u8>, ArtifactRejection> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(ArtifactRejection::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactRejection::Missing)
            }
            Err(e) => return Err(ArtifactRejection::Unreadable(e.to_string())),
        };

        if metadata.len() < self.min_size {
            return Err(ArtifactRejection::TooSmall {
                size: metadata.len(),
                min: self.min_size,
            });
        }

        let bytes = std::fs::read(path).map_err(|e| ArtifactRejection::Unreadable(e.to_string()))?;
        if !bytes.starts_with(PDF_SIGNATURE) {
            return Err(ArtifactRejection::BadSignature);
        }
        Ok(bytes)
    }

    fn extract(&self, path: &Path, bytes: &[u8]) -> Result<String, ArtifactRejection> {
        let result = match self.extractor.extract(bytes) {
            Ok(text) if text.trim().is_empty() => {
                Err(ArtifactRejection::NoText("extracted text is empty".to_string()))
            }
            Ok(text) => Ok(text),
            Err(e) => Err(ArtifactRejection::NoText(e.to_string())),
        };
        if let Err(reason) = &result {
            tracing::warn!("Rejected artifact {}: {}", path.display(), reason);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Treats everything after the signature as the document text
    pub(crate) struct TailTextExtractor;

    impl TextExtractor for TailTextExtractor {
        fn extract(&self, bytes: &[u8]) -> anyhow::Result<String> {
            let tail = &bytes[PDF_SIGNATURE.len().min(bytes.len())..];
            Ok(String::from_utf8_lossy(tail)
                .chars()
                .filter(|c| !c.is_control())
                .collect())
        }
    }

    fn validator() -> ArtifactValidator {
        ArtifactValidator::new(Arc::new(TailTextExtractor))
    }

    fn write(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn pdf_with(fill: u8, len: usize) -> Vec<u8> {
        let mut bytes = PDF_SIGNATURE.to_vec();
        bytes.resize(len, fill);
        bytes
    }

    #[test]
    fn test_missing_artifact() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            validator().validate(&dir.path().join("absent.pdf")),
            Err(ArtifactRejection::Missing)
        );
    }

    #[test]
    fn test_too_small() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "small.pdf", &pdf_with(b'a', 500));
        assert_eq!(
            validator().validate(&path),
            Err(ArtifactRejection::TooSmall { size: 500, min: 1024 })
        );
    }

    #[test]
    fn test_missing_signature() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "html.pdf", &vec![b'<'; 2048]);
        assert_eq!(validator().validate(&path), Err(ArtifactRejection::BadSignature));
    }

    #[test]
    fn test_signature_without_text() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "blank.pdf", &pdf_with(b' ', 2048));
        assert!(matches!(
            validator().validate(&path),
            Err(ArtifactRejection::NoText(_))
        ));
    }

    #[test]
    fn test_valid_artifact() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "good.pdf", &pdf_with(b'x', 2048));
        assert!(validator().is_valid(&path));

        let text = validator().validate_and_extract(&path).unwrap();
        assert_eq!(text.len(), 2044);
    }

    #[test]
    fn test_text_check_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "blank.pdf", &pdf_with(b' ', 2048));
        let config = ValidationConfig {
            require_text: false,
            ..ValidationConfig::default()
        };
        let validator = ArtifactValidator::from_config(&config, Arc::new(TailTextExtractor));
        assert!(validator.is_valid(&path));
    }

    #[test]
    fn test_directory_is_missing() {
        let dir = TempDir::new().unwrap();
        assert_eq!(validator().validate(dir.path()), Err(ArtifactRejection::Missing));
    }
}
