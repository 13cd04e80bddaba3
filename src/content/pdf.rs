//! PDF text extraction
//!
//! Extracts text content from PDF documents using pdf-extract.

use anyhow::{Context, Result};

use super::TextExtractor;

/// Signature every PDF starts with
pub const PDF_SIGNATURE: &[u8; 4] = b"%PDF";

/// PDF content extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

impl PdfTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl TextExtractor for PdfTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String> {
        // pdf-extract panics on some malformed inputs; one bad file must not stop the batch
        let extracted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem(bytes)
        }))
        .map_err(|_| anyhow::anyhow!("PDF parser panicked on malformed input"))?
        .context("Failed to extract text from PDF")?;

        Ok(clean_text(&extracted))
    }
}

/// Clean up common PDF extraction artifacts
pub fn clean_text(text: &str) -> String {
    text.lines()
        // Trim whitespace from each line
        .map(|l| l.trim())
        // Remove empty lines but preserve paragraph breaks
        .fold(Vec::new(), |mut acc, line| {
            if line.is_empty() {
                // Only add empty line if previous wasn't empty
                if acc.last().map(|l: &String| !l.is_empty()).unwrap_or(false) {
                    acc.push(String::new());
                }
            } else {
                acc.push(line.to_string());
            }
            acc
        })
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text() {
        let dirty = "  Line 1  \n\n\n  Line 2  \n  \n  Line 3  ";
        let cleaned = clean_text(dirty);
        assert_eq!(cleaned, "Line 1\n\nLine 2\n\nLine 3");
    }

    #[test]
    fn test_clean_text_whitespace_only() {
        assert_eq!(clean_text(" \n\t\n  "), "");
    }

    #[test]
    fn test_garbage_is_an_error() {
        let extractor = PdfTextExtractor::new();
        let mut bytes = PDF_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 2048]);
        assert!(extractor.extract(&bytes).is_err());
    }
}
