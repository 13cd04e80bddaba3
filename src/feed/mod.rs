//! Feed parsing
//!
//! Turns the published feed file into a stream of [`EntityRecord`]s.

mod xml;

pub use xml::{FeedLayout, XmlFeedParser};

use std::path::Path;
use thiserror::Error;

use crate::types::EntityRecord;

/// Errors raised while reading a feed
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("record ending at byte {position} has no '{attribute}'")]
    MissingId { position: u64, attribute: String },
}

impl FeedError {
    /// Whether the rest of the stream can still be trusted
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FeedError::MissingId { .. })
    }
}

/// Stream of parsed records
pub type RecordStream = Box<dyn Iterator<Item = Result<EntityRecord, FeedError>> + Send>;

/// Parses a feed file into entity records
pub trait FeedParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<RecordStream, FeedError>;
}
