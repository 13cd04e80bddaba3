//! Outbound call plumbing: cancellation, throttling, retries and HTTP fetches
//!
//! Every external call a stage makes goes through the same three layers:
//!
//! ```text
//! RetryExecutor::execute ──► RateLimiter::acquire ──► ArtifactFetcher::fetch
//!        ▲                          ▲                          ▲
//!        └────────── CancelSignal (one signal aborts every wait) ┘
//! ```

pub mod cancel;
pub mod fetcher;
pub mod rate_limit;
pub mod retry;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal, Cancelled};
pub use fetcher::{ArtifactFetcher, FetchConfig, FetchError, FetchedArtifact, HttpArtifactFetcher};
pub use rate_limit::RateLimiter;
pub use retry::{classify_message, Classify, FailureClass, RetryError, RetryExecutor, RetryPolicy};
