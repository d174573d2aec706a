// Cluster verification for CaseStrainer
// Resolves each cluster against the citation database through the cache,
// rate limiter, and single-flight build locks

use crate::domain::{Cluster, VerificationStatus};
use crate::providers::rate_limiter::RateLimiter;
use crate::providers::{CitationDatabase, ProviderError};
use crate::services::cache::{BuildSlot, CitationCache};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How many server-side throttles one lookup tolerates before giving up.
const MAX_THROTTLE_ROUNDS: u32 = 3;

/// One citation's resolution, before it is folded into cluster status.
enum LookupOutcome {
    Found(crate::domain::CitationLookup),
    NotFound,
    Error(String),
    Cancelled,
}

pub struct Verifier {
    database: Arc<dyn CitationDatabase>,
    cache: Arc<CitationCache>,
    rate_limiter: Arc<RateLimiter>,
    source_name: String,
}

impl Verifier {
    pub fn new(
        database: Arc<dyn CitationDatabase>,
        cache: Arc<CitationCache>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            database,
            cache,
            rate_limiter,
            source_name: "citation-db".to_string(),
        }
    }

    pub fn remaining_quota(&self) -> i64 {
        self.database.remaining_quota()
    }

    /// Verify one cluster in place. The primary citation is tried first; on
    /// a miss each remaining occurrence is tried in order. A later
    /// occurrence succeeding marks the cluster verified_by_parallel.
    ///
    /// Returns false when the job was cancelled mid-verification; the
    /// cluster is left untouched in that case.
    #[instrument(skip(self, cluster, cancel), fields(cluster_id = %cluster.cluster_id))]
    pub async fn verify_cluster(&self, cluster: &mut Cluster, cancel: &CancellationToken) -> bool {
        let mut last_error: Option<String> = None;
        let occurrences = cluster.occurrences.clone();

        for (position, occurrence) in occurrences.iter().enumerate() {
            if cancel.is_cancelled() {
                return false;
            }

            match self.lookup(&occurrence.normalized_text, cancel).await {
                LookupOutcome::Found(lookup) => {
                    cluster.verification_status = if position == 0 {
                        VerificationStatus::Verified
                    } else {
                        VerificationStatus::VerifiedByParallel
                    };
                    cluster.canonical_name = lookup.canonical_name;
                    cluster.canonical_date = lookup.canonical_date;
                    cluster.canonical_url = lookup.url;
                    cluster.failure_reason = None;
                    info!(
                        "Cluster {} verified via {} ({})",
                        cluster.cluster_id,
                        occurrence.normalized_text,
                        if position == 0 { "primary" } else { "parallel" }
                    );
                    return true;
                }
                LookupOutcome::NotFound => {
                    debug!(
                        "Citation {} not found, trying next occurrence",
                        occurrence.normalized_text
                    );
                }
                LookupOutcome::Error(reason) => {
                    warn!(
                        "Lookup failed for {}: {}",
                        occurrence.normalized_text, reason
                    );
                    last_error = Some(reason);
                }
                LookupOutcome::Cancelled => return false,
            }
        }

        match last_error {
            Some(reason) => {
                cluster.verification_status = VerificationStatus::Failed;
                cluster.failure_reason = Some(reason);
            }
            None => {
                cluster.verification_status = VerificationStatus::Unverified;
            }
        }
        true
    }

    /// Resolve one normalized citation: verified cache, then cached
    /// negative, then an owned or awaited database call. At most one
    /// concurrent call per fingerprint leaves this process.
    async fn lookup(&self, normalized: &str, cancel: &CancellationToken) -> LookupOutcome {
        let fingerprint = CitationCache::fingerprint(normalized);

        // Two rounds: a waiter re-reads the cache after the in-flight build
        // finishes, and claims the slot itself if the builder stored nothing.
        for _ in 0..2 {
            if let Some(entry) = self.cache.get_verified(&fingerprint).await {
                debug!("Verified cache hit for {}", normalized);
                return LookupOutcome::Found(entry.payload);
            }
            if self.cache.get_unverified(&fingerprint).await.is_some() {
                debug!("Negative cache hit for {}", normalized);
                return LookupOutcome::NotFound;
            }

            match self.cache.begin_build(&fingerprint).await {
                BuildSlot::Owner(guard) => {
                    let outcome = self.call_database(&fingerprint, normalized, cancel).await;
                    guard.finish().await;
                    return outcome;
                }
                BuildSlot::Waiter(mut rx) => {
                    debug!("Waiting on in-flight lookup for {}", normalized);
                    if !*rx.borrow() {
                        tokio::select! {
                            _ = rx.changed() => {}
                            _ = cancel.cancelled() => return LookupOutcome::Cancelled,
                        }
                    }
                }
            }
        }

        LookupOutcome::Error("in-flight lookup produced no cache entry".to_string())
    }

    async fn call_database(
        &self,
        fingerprint: &str,
        normalized: &str,
        cancel: &CancellationToken,
    ) -> LookupOutcome {
        let mut throttle_rounds = 0;

        loop {
            if !self.rate_limiter.acquire(cancel).await {
                return LookupOutcome::Cancelled;
            }

            match self.database.lookup(normalized).await {
                Ok(lookup) if lookup.found => {
                    if let Err(e) = self
                        .cache
                        .put_verified(fingerprint, lookup.clone(), &self.source_name)
                        .await
                    {
                        warn!("Failed to cache verified result: {}", e);
                    }
                    return LookupOutcome::Found(lookup);
                }
                Ok(lookup) => {
                    if let Err(e) = self
                        .cache
                        .put_unverified(fingerprint, lookup, &self.source_name)
                        .await
                    {
                        warn!("Failed to cache negative result: {}", e);
                    }
                    return LookupOutcome::NotFound;
                }
                Err(ProviderError::RateLimited { retry_after }) => {
                    throttle_rounds += 1;
                    if throttle_rounds > MAX_THROTTLE_ROUNDS {
                        return LookupOutcome::Error(
                            "rate limited beyond throttle budget".to_string(),
                        );
                    }
                    // Drain the local bucket so sibling verifications back
                    // off too, then retry this lookup.
                    self.rate_limiter.throttle(retry_after).await;
                }
                // Non-429 client responses are authoritative negatives.
                Err(ProviderError::NotFound) => {
                    let negative = crate::domain::CitationLookup::not_found();
                    if let Err(e) = self
                        .cache
                        .put_unverified(fingerprint, negative, &self.source_name)
                        .await
                    {
                        warn!("Failed to cache negative result: {}", e);
                    }
                    return LookupOutcome::NotFound;
                }
                Err(ProviderError::InvalidResponse(reason)) => {
                    debug!("Authoritative negative for {}: {}", normalized, reason);
                    return LookupOutcome::NotFound;
                }
                Err(ProviderError::AuthenticationFailed(reason)) => {
                    // Misconfiguration, not a property of the citation; the
                    // cluster fails rather than reading as unverified.
                    return LookupOutcome::Error(format!("authentication failed: {}", reason));
                }
                Err(e) => return LookupOutcome::Error(e.to_string()),
            }
        }
    }
}
