// CourtListener citation-lookup integration
// Resolves normalized citations against the CourtListener REST API

use crate::domain::CitationLookup;
use crate::providers::client::ProviderClient;
use crate::providers::{CitationDatabase, ProviderError, ProviderResult, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const COURTLISTENER_BASE_URL: &str = "https://www.courtlistener.com/api/rest/v3";

pub struct CourtListenerProvider {
    client: ProviderClient,
    api_token: String,
    base_url: String,
    /// Remaining request budget as last reported by the server, or a local
    /// estimate. -1 means unknown.
    remaining: AtomicI64,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupEntry {
    pub citation: String,
    #[serde(default)]
    pub normalized_citations: Vec<String>,
    /// Per-citation HTTP-style status: 200 found, 404 not found, 429 too
    /// ambiguous.
    pub status: u16,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub clusters: Vec<LookupCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupCluster {
    pub absolute_url: String,
    pub case_name: String,
    #[serde(default)]
    pub date_filed: Option<String>,
    #[serde(default)]
    pub docket: Option<String>,
    #[serde(default)]
    pub court: Option<String>,
}

impl CourtListenerProvider {
    pub fn new(api_token: String, timeout: Duration, retry: RetryConfig) -> ProviderResult<Self> {
        Self::with_base_url(api_token, COURTLISTENER_BASE_URL, timeout, retry)
    }

    /// Point the provider at a different host. Tests use this to talk to a
    /// local fixture server.
    pub fn with_base_url(
        api_token: String,
        base_url: &str,
        timeout: Duration,
        retry: RetryConfig,
    ) -> ProviderResult<Self> {
        if api_token.is_empty() {
            return Err(ProviderError::Configuration(
                "CourtListener API token is empty".to_string(),
            ));
        }

        let client = ProviderClient::new("courtlistener", timeout, retry)?;

        Ok(Self {
            client,
            api_token,
            base_url: base_url.trim_end_matches('/').to_string(),
            remaining: AtomicI64::new(-1),
        })
    }

    fn record_quota(&self, response: &reqwest::Response) {
        if let Some(remaining) = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.remaining.store(remaining, Ordering::Relaxed);
        } else {
            // No header; decay the local estimate if one exists.
            let _ = self
                .remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    if v > 0 {
                        Some(v - 1)
                    } else {
                        None
                    }
                });
        }
    }
}

#[async_trait]
impl CitationDatabase for CourtListenerProvider {
    #[instrument(skip(self))]
    async fn lookup(&self, normalized_citation: &str) -> Result<CitationLookup, ProviderError> {
        debug!("Looking up citation: {}", normalized_citation);

        let url = format!("{}/citation-lookup/", self.base_url);
        let response = self
            .client
            .post_form_with_token(&url, &self.api_token, &[("text", normalized_citation)])
            .await?;

        self.record_quota(&response);

        let entries: Vec<LookupEntry> = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("JSON decode failed: {}", e)))?;

        let Some(entry) = entries.into_iter().next() else {
            warn!("Empty citation-lookup response for {}", normalized_citation);
            return Ok(CitationLookup::not_found());
        };

        match entry.status {
            200 => {
                let Some(cluster) = entry.clusters.into_iter().next() else {
                    return Ok(CitationLookup::not_found());
                };
                info!(
                    "Citation {} resolved to {}",
                    normalized_citation, cluster.case_name
                );
                Ok(CitationLookup {
                    found: true,
                    canonical_name: Some(cluster.case_name),
                    canonical_date: cluster.date_filed,
                    court: cluster.court,
                    docket: cluster.docket,
                    url: Some(absolute(&self.base_url, &cluster.absolute_url)),
                })
            }
            404 => {
                debug!("Citation {} not found", normalized_citation);
                Ok(CitationLookup::not_found())
            }
            // The lookup endpoint marks ambiguous citations with a 429
            // status inside an otherwise-successful body; that is an
            // authoritative "cannot resolve", not a transport rate limit.
            429 => {
                debug!("Citation {} ambiguous: {}", normalized_citation, entry.error_message);
                Ok(CitationLookup::not_found())
            }
            other => Err(ProviderError::InvalidResponse(format!(
                "Unexpected lookup status {} for {}",
                other, normalized_citation
            ))),
        }
    }

    fn remaining_quota(&self) -> i64 {
        self.remaining.load(Ordering::Relaxed)
    }
}

/// CourtListener returns site-relative opinion URLs.
fn absolute(base_url: &str, path: &str) -> String {
    if path.starts_with("http") {
        path.to_string()
    } else {
        let origin = base_url
            .find("/api/")
            .map(|i| &base_url[..i])
            .unwrap_or(base_url);
        format!("{}{}", origin, path)
    }
}
