//! filing-harvest: resumable, incrementally-diffable batch harvesting
//!
//! Pulls a published entity feed, extracts per-entity document references,
//! downloads and validates each document, then classifies its text:
//! - Stage pipeline with explicit phases and a shared processing context
//! - Per-entity resume from the CSV outputs of an interrupted run
//! - Incremental runs against a baseline of prior filing dates
//! - Rate-limited, retried, cancellable outbound fetches

pub mod config;
pub mod content;
pub mod feed;
pub mod fetching;
pub mod incremental;
pub mod pipeline;
pub mod records;
pub mod resume;
pub mod types;

pub use config::Config;
pub use types::*;
