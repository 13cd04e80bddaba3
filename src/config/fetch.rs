//! Outbound call configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::DEFAULT_USER_AGENT;
use crate::fetching::{FetchConfig, RateLimiter, RetryPolicy};

/// HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum artifact size in bytes
    #[serde(default = "default_max_content_size")]
    pub max_content_size: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_connections_per_host")]
    pub connections_per_host: usize,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_content_size() -> u64 {
    50 * 1024 * 1024
}

fn default_max_redirects() -> usize {
    5
}

fn default_connections_per_host() -> usize {
    2
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_content_size: default_max_content_size(),
            max_redirects: default_max_redirects(),
            connections_per_host: default_connections_per_host(),
        }
    }
}

impl FetchSettings {
    pub fn to_fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_content_size: self.max_content_size,
            max_redirects: self.max_redirects,
            connections_per_host: self.connections_per_host,
        }
    }
}

/// Outbound call budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Permits per window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    /// Window width in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_requests_per_window() -> u32 {
    2
}

fn default_window_ms() -> u64 {
    1000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn build(&self) -> RateLimiter {
        RateLimiter::new(self.requests_per_window, Duration::from_millis(self.window_ms))
    }
}

/// Retry budget for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}
