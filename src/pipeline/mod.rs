//! Stage pipeline
//!
//! ```text
//! DownloadingFeed      ─► feed file
//! ParsingFeed          ─► <base>_parsed_<token>.csv
//! ExtractingReferences ─► <base>_references_<token>.csv
//! DownloadingArtifacts ─► <base>_downloads_<token>.csv + artifacts
//! AnalyzingArtifacts   ─► <base>_results_<token>.csv
//! ```
//!
//! The [`StageOrchestrator`] drives a [`ProcessingContext`] through these
//! phases, one stage at a time.

pub mod context;
pub mod orchestrator;
pub mod progress;
pub mod stages;
pub mod status;

pub use context::{ContextError, ContextSnapshot, Phase, ProcessingContext, RunOptions};
pub use orchestrator::{Collaborators, PipelineError, RunSummary, StageOrchestrator};
pub use progress::{StageCounts, StageProgress, Tally};
pub use stages::{StageError, StageFiles, StageMode, StageReport};
pub use status::{inspect, StatusReport};
