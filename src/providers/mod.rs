// Provider layer for CaseStrainer
// Handles integration with the external citation database

pub mod client;
pub mod courtlistener;
pub mod rate_limiter;

use crate::domain::CitationLookup;
use async_trait::async_trait;
use std::time::Duration;

/// Authoritative citation database consumed by the verifier. The concrete
/// backend is constructor-injected; tests supply fakes.
#[async_trait]
pub trait CitationDatabase: Send + Sync {
    /// Look up one normalized citation (e.g. "410 U.S. 113"). A well-formed
    /// "no such citation" answer is `Ok` with `found = false`, not an error.
    async fn lookup(&self, normalized_citation: &str) -> Result<CitationLookup, ProviderError>;

    /// Remaining per-hour request budget advertised by the backend, or -1
    /// when unknown.
    fn remaining_quota(&self) -> i64;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_multiplier: 2.0,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_hour: u32,
    pub burst_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: 100,
            burst_limit: 10,
        }
    }
}

// Provider error types
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Resource not found")]
    NotFound,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Transient errors are retried internally and surface only when the
    /// retry budget is exhausted. Non-429 4xx responses are authoritative
    /// and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::ServiceUnavailable(_)
        )
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
