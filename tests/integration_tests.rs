// Integration tests for CaseStrainer
// End-to-end job runs against a fake citation database and in-memory store

use async_trait::async_trait;
use casestrainer::config::AppConfig;
use casestrainer::domain::{
    CitationKind, CitationLookup, InputDescriptor, Job, JobState, VerificationStatus,
};
use casestrainer::providers::rate_limiter::RateLimiter;
use casestrainer::providers::{CitationDatabase, ProviderError, RateLimitConfig};
use casestrainer::services::cache::{CitationCache, KeyValueStore, MemoryStore};
use casestrainer::services::job_runtime::JobRuntime;
use casestrainer::services::loader::StandardLoader;
use casestrainer::services::pipeline::CitationPipeline;
use casestrainer::services::verifier::Verifier;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Fake citation database
// ============================================================================

struct FakeDatabase {
    records: Mutex<HashMap<String, CitationLookup>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeDatabase {
    fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn insert(&self, citation: &str, name: &str, date: &str) {
        self.records.lock().unwrap().insert(
            citation.to_string(),
            CitationLookup {
                found: true,
                canonical_name: Some(name.to_string()),
                canonical_date: Some(date.to_string()),
                court: Some("scotus".to_string()),
                docket: None,
                url: Some(format!(
                    "https://www.courtlistener.com/opinion/{}/",
                    name.to_lowercase().replace(' ', "-")
                )),
            },
        );
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CitationDatabase for FakeDatabase {
    async fn lookup(&self, citation: &str) -> Result<CitationLookup, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(citation)
            .cloned()
            .unwrap_or_else(CitationLookup::not_found))
    }

    fn remaining_quota(&self) -> i64 {
        -1
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    runtime: Arc<JobRuntime>,
    database: Arc<FakeDatabase>,
}

fn harness(database: Arc<FakeDatabase>, rate: RateLimitConfig) -> Harness {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = Arc::new(CitationCache::new(Arc::clone(&store)));
    let rate_limiter = Arc::new(RateLimiter::new(&rate));
    let verifier = Arc::new(Verifier::new(
        Arc::clone(&database) as Arc<dyn CitationDatabase>,
        Arc::clone(&cache),
        rate_limiter,
    ));

    let config = AppConfig {
        worker_concurrency: 2,
        verify_concurrency: 4,
        ..AppConfig::default()
    };

    let runtime = Arc::new(JobRuntime::new(
        store,
        Arc::new(StandardLoader::new(Duration::from_secs(5))),
        Arc::new(CitationPipeline::new()),
        Some(verifier),
        cache,
        config,
    ));
    runtime.start();

    Harness { runtime, database }
}

fn harness_without_verifier() -> Arc<JobRuntime> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = Arc::new(CitationCache::new(Arc::clone(&store)));
    let runtime = Arc::new(JobRuntime::new(
        store,
        Arc::new(StandardLoader::new(Duration::from_secs(5))),
        Arc::new(CitationPipeline::new()),
        None,
        cache,
        AppConfig::default(),
    ));
    runtime.start();
    runtime
}

async fn submit_text(runtime: &Arc<JobRuntime>, text: &str) -> String {
    runtime
        .submit(InputDescriptor::Text {
            text: text.to_string(),
        })
        .await
        .expect("submit failed")
}

async fn wait_terminal(runtime: &Arc<JobRuntime>, job_id: &str) -> Job {
    for _ in 0..200 {
        let job = runtime.status(job_id).await.expect("status failed");
        if job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} never reached a terminal state", job_id);
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn test_roe_v_wade_end_to_end() {
    let database = Arc::new(FakeDatabase::new());
    database.insert("410 U.S. 113", "Roe v. Wade", "1973-01-22");
    let h = harness(Arc::clone(&database), RateLimitConfig::default());

    let job_id = submit_text(
        &h.runtime,
        "The Court ruled in Roe v. Wade, 410 U.S. 113 (1973), that...",
    )
    .await;
    let job = wait_terminal(&h.runtime, &job_id).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);

    let result = job.result.expect("completed job carries a result");
    assert_eq!(result.clusters.len(), 1);

    let cluster = &result.clusters[0];
    assert_eq!(cluster.extracted_name.as_deref(), Some("Roe v. Wade"));
    assert_eq!(cluster.extracted_date, Some(1973));
    assert_eq!(cluster.verification_status, VerificationStatus::Verified);
    assert_eq!(cluster.canonical_name.as_deref(), Some("Roe v. Wade"));
    assert!(cluster.canonical_url.is_some());

    // The database was called with the normalized citation, exactly once.
    assert_eq!(h.database.call_count(), 1);
}

#[tokio::test]
async fn test_brown_parallel_citations_one_cluster() {
    let database = Arc::new(FakeDatabase::new());
    database.insert("347 U.S. 483", "Brown v. Board of Education", "1954-05-17");
    let h = harness(database, RateLimitConfig::default());

    let job_id = submit_text(
        &h.runtime,
        "See Brown v. Board of Educ., 347 U.S. 483, 495, 74 S. Ct. 686 (1954).",
    )
    .await;
    let job = wait_terminal(&h.runtime, &job_id).await;

    let result = job.result.expect("result");
    assert_eq!(result.citations.len(), 2);
    assert_eq!(result.clusters.len(), 1);

    let cluster = &result.clusters[0];
    assert_eq!(cluster.occurrences.len(), 2);
    assert_eq!(cluster.occurrences[0].pin_cite, Some(495));
    assert_eq!(
        cluster.extracted_name.as_deref(),
        Some("Brown v. Board of Education")
    );
    assert_eq!(cluster.verification_status, VerificationStatus::Verified);
}

#[tokio::test]
async fn test_isolation_prevents_name_bleed() {
    let database = Arc::new(FakeDatabase::new());
    database.insert("521 U.S. 811", "Raines v. Byrd", "1997-06-26");
    database.insert("524 U.S. 417", "Clinton v. City of New York", "1998-06-25");
    let h = harness(database, RateLimitConfig::default());

    let job_id = submit_text(
        &h.runtime,
        "...citing Raines v. Byrd, 521 U.S. 811 (1997); see also Clinton v. City of New York, 524 U.S. 417 (1998).",
    )
    .await;
    let job = wait_terminal(&h.runtime, &job_id).await;

    let result = job.result.expect("result");
    assert_eq!(result.clusters.len(), 2);
    assert_eq!(
        result.clusters[0].extracted_name.as_deref(),
        Some("Raines v. Byrd")
    );
    // The critical assertion: the second name must not have swallowed the
    // first citation's sentence.
    assert_eq!(
        result.clusters[1].extracted_name.as_deref(),
        Some("Clinton v. City of New York")
    );
}

#[tokio::test]
async fn test_statute_excluded_from_clusters() {
    let database = Arc::new(FakeDatabase::new());
    database.insert("347 U.S. 483", "Brown v. Board of Education", "1954-05-17");
    let h = harness(Arc::clone(&database), RateLimitConfig::default());

    let job_id = submit_text(
        &h.runtime,
        "Claims under 42 U.S.C. § 1983 often cite Brown v. Board of Educ., 347 U.S. 483 (1954).",
    )
    .await;
    let job = wait_terminal(&h.runtime, &job_id).await;

    let result = job.result.expect("result");
    assert_eq!(result.clusters.len(), 1);
    assert_eq!(result.metadata.statutes_excluded, 1);

    let statute = result
        .citations
        .iter()
        .find(|c| c.kind == CitationKind::Statute)
        .expect("statute present in the flat view");
    assert_eq!(statute.normalized_text, "42 U.S.C. § 1983");

    // Only the case citation reached the database.
    assert_eq!(h.database.call_count(), 1);
}

#[tokio::test]
async fn test_rate_limit_bounds_database_calls() {
    let database = Arc::new(FakeDatabase::with_delay(Duration::from_millis(10)));
    // Empty bucket refills at 5/hr: only the burst of 5 is available now.
    let h = harness(
        Arc::clone(&database),
        RateLimitConfig {
            requests_per_hour: 5,
            burst_limit: 5,
        },
    );

    let text = (0..8)
        .map(|i| format!("Case{} v. Other{}, {} F.3d {} (200{}).", i, i, 100 + i, 200 + i, i))
        .collect::<Vec<_>>()
        .join(" ");
    let job_id = submit_text(&h.runtime, &text).await;

    // Give verification time to burn the burst and hit the empty bucket.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(
        h.database.call_count() <= 5,
        "rate limiter allowed {} calls",
        h.database.call_count()
    );

    // Progress stays monotonic while the remainder queues.
    let a = h.runtime.status(&job_id).await.unwrap().progress;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let b = h.runtime.status(&job_id).await.unwrap().progress;
    assert!(b >= a);

    // The job is still cancellable while starved.
    assert!(h.runtime.cancel(&job_id).await.unwrap());
    let job = wait_terminal(&h.runtime, &job_id).await;
    assert_eq!(job.state, JobState::Cancelled);
    assert!(h.database.call_count() <= 5);
}

#[tokio::test]
async fn test_cancel_before_verification_finishes() {
    let database = Arc::new(FakeDatabase::with_delay(Duration::from_millis(400)));
    for i in 0..6 {
        database.insert(
            &format!("{} F.3d {}", 100 + i, 200 + i),
            &format!("Case{} v. Other{}", i, i),
            "2001-01-01",
        );
    }
    let h = harness(Arc::clone(&database), RateLimitConfig::default());

    let text = (0..6)
        .map(|i| format!("Case{} v. Other{}, {} F.3d {} (2001).", i, i, 100 + i, 200 + i))
        .collect::<Vec<_>>()
        .join(" ");
    let job_id = submit_text(&h.runtime, &text).await;

    // Wait for extraction to finish and verification to begin.
    for _ in 0..100 {
        let job = h.runtime.status(&job_id).await.unwrap();
        if job.progress >= 40 || job.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(h.runtime.cancel(&job_id).await.unwrap());
    let job = wait_terminal(&h.runtime, &job_id).await;

    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.result.is_none(), "cancelled jobs carry no partial results");
    assert!(job.error.is_none());

    // No further database calls once the cancellation lands.
    let at_cancel = h.database.call_count();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(h.database.call_count(), at_cancel);
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn test_zero_citations_completes_empty() {
    let h = harness(Arc::new(FakeDatabase::new()), RateLimitConfig::default());

    let job_id = submit_text(&h.runtime, "No citations appear anywhere in this text.").await;
    let job = wait_terminal(&h.runtime, &job_id).await;

    assert_eq!(job.state, JobState::Completed);
    let result = job.result.expect("result");
    assert!(result.clusters.is_empty());
    assert_eq!(result.metadata.total, 0);
    assert_eq!(h.database.call_count(), 0);
}

#[tokio::test]
async fn test_counts_internally_consistent() {
    let database = Arc::new(FakeDatabase::new());
    database.insert("410 U.S. 113", "Roe v. Wade", "1973-01-22");
    // "999 F.3d 999" stays unverified.
    let h = harness(database, RateLimitConfig::default());

    let job_id = submit_text(
        &h.runtime,
        "Roe v. Wade, 410 U.S. 113 (1973). Unknown v. Case, 999 F.3d 999 (2020). 42 U.S.C. § 1983.",
    )
    .await;
    let job = wait_terminal(&h.runtime, &job_id).await;

    let m = job.result.expect("result").metadata;
    assert_eq!(
        m.verified + m.verified_by_parallel + m.unverified + m.failed,
        m.total_clusters
    );
    assert_eq!(m.verified, 1);
    assert_eq!(m.unverified, 1);
    assert_eq!(m.statutes_excluded, 1);
}

#[tokio::test]
async fn test_repeat_submission_hits_caches() {
    let database = Arc::new(FakeDatabase::new());
    database.insert("410 U.S. 113", "Roe v. Wade", "1973-01-22");
    let h = harness(Arc::clone(&database), RateLimitConfig::default());

    let text = "Roe v. Wade, 410 U.S. 113 (1973).";
    let first_id = submit_text(&h.runtime, text).await;
    let first = wait_terminal(&h.runtime, &first_id).await;

    let second_id = submit_text(&h.runtime, text).await;
    let second = wait_terminal(&h.runtime, &second_id).await;

    assert_eq!(second.state, JobState::Completed);
    assert_eq!(
        first.result.as_ref().unwrap().clusters,
        second.result.as_ref().unwrap().clusters
    );
    // The verified cache absorbed the second lookup.
    assert_eq!(h.database.call_count(), 1);
}

#[tokio::test]
async fn test_verification_skipped_without_database() {
    let runtime = harness_without_verifier();

    let job_id = submit_text(&runtime, "Roe v. Wade, 410 U.S. 113 (1973).").await;
    let job = wait_terminal(&runtime, &job_id).await;

    assert_eq!(job.state, JobState::Completed);
    let result = job.result.expect("result");
    assert_eq!(
        result.clusters[0].verification_status,
        VerificationStatus::Unverified
    );
    assert!(result
        .metadata
        .warnings
        .iter()
        .any(|w| w.contains("no citation database")));
}

#[tokio::test]
async fn test_progress_monotonic_across_poll() {
    let database = Arc::new(FakeDatabase::with_delay(Duration::from_millis(150)));
    for i in 0..5 {
        database.insert(
            &format!("{} F.3d {}", 300 + i, 400 + i),
            &format!("Alpha{} v. Beta{}", i, i),
            "2010-01-01",
        );
    }
    let h = harness(database, RateLimitConfig::default());

    let text = (0..5)
        .map(|i| format!("Alpha{} v. Beta{}, {} F.3d {} (2010).", i, i, 300 + i, 400 + i))
        .collect::<Vec<_>>()
        .join(" ");
    let job_id = submit_text(&h.runtime, &text).await;

    let mut last = 0u8;
    loop {
        let job = h.runtime.status(&job_id).await.unwrap();
        assert!(job.progress >= last, "progress regressed {} -> {}", last, job.progress);
        last = job.progress;
        if job.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(last, 100);
}

// ============================================================================
// Runtime delivery semantics
// ============================================================================

fn runtime_on_store(store: Arc<dyn KeyValueStore>, config: AppConfig) -> Arc<JobRuntime> {
    let cache = Arc::new(CitationCache::new(Arc::clone(&store)));
    let runtime = Arc::new(JobRuntime::new(
        store,
        Arc::new(StandardLoader::new(Duration::from_secs(5))),
        Arc::new(CitationPipeline::new()),
        None,
        cache,
        config,
    ));
    runtime.start();
    runtime
}

/// Seed a job record and queue entry as a dead worker would have left them.
async fn seed_stale_claim(store: &Arc<dyn KeyValueStore>, attempt: u32) -> String {
    use casestrainer::services::cache::{encode_versioned, JOBS_PREFIX};
    use casestrainer::services::job_runtime::QUEUE_PREFIX;

    let mut job = casestrainer::domain::Job::new(
        format!("stale-{}", attempt),
        InputDescriptor::Text {
            text: "Roe v. Wade, 410 U.S. 113 (1973).".to_string(),
        },
    );
    job.state = casestrainer::domain::JobState::Running;
    job.attempt = attempt;
    job.claim_expires_at = Some(chrono::Utc::now() - chrono::Duration::minutes(1));

    store
        .put(
            &format!("{}{}", JOBS_PREFIX, job.job_id),
            &encode_versioned(&job).unwrap(),
            None,
        )
        .await
        .unwrap();
    store
        .put(
            &format!("{}{}", QUEUE_PREFIX, job.job_id),
            &chrono::Utc::now().to_rfc3339(),
            None,
        )
        .await
        .unwrap();
    job.job_id
}

#[tokio::test]
async fn test_expired_claim_is_redelivered() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let job_id = seed_stale_claim(&store, 1).await;

    let runtime = runtime_on_store(Arc::clone(&store), AppConfig::default());
    let job = wait_terminal(&runtime, &job_id).await;

    assert_eq!(job.state, JobState::Completed);
    // Redelivery bumped the attempt counter past the dead worker's claim.
    assert_eq!(job.attempt, 2);
}

#[tokio::test]
async fn test_retry_cap_fails_job() {
    use casestrainer::services::job_runtime::MAX_JOB_ATTEMPTS;

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let job_id = seed_stale_claim(&store, MAX_JOB_ATTEMPTS).await;

    let runtime = runtime_on_store(Arc::clone(&store), AppConfig::default());
    let job = wait_terminal(&runtime, &job_id).await;

    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.as_deref().unwrap().contains("claim expired"));
    assert!(job.result.is_none());
}

struct HangingLoader;

#[async_trait]
impl casestrainer::services::loader::DocumentLoader for HangingLoader {
    async fn load(
        &self,
        _descriptor: &InputDescriptor,
    ) -> Result<String, casestrainer::services::loader::LoaderError> {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok(String::new())
    }
}

#[tokio::test]
async fn test_stalled_job_fails_with_watchdog() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = Arc::new(CitationCache::new(Arc::clone(&store)));
    let config = AppConfig {
        stall_timeout_seconds: 1,
        ..AppConfig::default()
    };
    let runtime = Arc::new(JobRuntime::new(
        store,
        Arc::new(HangingLoader),
        Arc::new(CitationPipeline::new()),
        None,
        cache,
        config,
    ));
    runtime.start();

    let job_id = submit_text(&runtime, "Roe v. Wade, 410 U.S. 113 (1973).").await;
    let job = wait_terminal(&runtime, &job_id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.as_deref(), Some("stalled"));
}

#[tokio::test]
async fn test_sqlite_store_backs_full_job() {
    use casestrainer::services::cache::SqliteStore;
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("casestrainer.db");
    let store_url = format!("sqlite://{}", db_path.display());

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::connect(&store_url).await.unwrap());
    store.health_check().await.unwrap();

    // CAS semantics match the in-memory store.
    assert!(store.put_if("jobs/x", "a", None, None).await.unwrap());
    assert!(!store.put_if("jobs/x", "b", None, None).await.unwrap());
    assert!(store.put_if("jobs/x", "b", Some("a"), None).await.unwrap());
    assert_eq!(store.get("jobs/x").await.unwrap().as_deref(), Some("b"));

    let cache = Arc::new(CitationCache::new(Arc::clone(&store)));
    let database = Arc::new(FakeDatabase::new());
    database.insert("410 U.S. 113", "Roe v. Wade", "1973-01-22");
    let verifier = Arc::new(Verifier::new(
        Arc::clone(&database) as Arc<dyn CitationDatabase>,
        Arc::clone(&cache),
        Arc::new(RateLimiter::new(&RateLimitConfig::default())),
    ));

    let runtime = Arc::new(JobRuntime::new(
        store,
        Arc::new(StandardLoader::new(Duration::from_secs(5))),
        Arc::new(CitationPipeline::new()),
        Some(verifier),
        cache,
        AppConfig::default(),
    ));
    runtime.start();

    let job_id = submit_text(&runtime, "Roe v. Wade, 410 U.S. 113 (1973).").await;
    let job = wait_terminal(&runtime, &job_id).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(
        job.result.unwrap().clusters[0].verification_status,
        VerificationStatus::Verified
    );
}

#[tokio::test]
async fn test_url_fetch_failure_fails_job() {
    let h = harness(Arc::new(FakeDatabase::new()), RateLimitConfig::default());

    let job_id = h
        .runtime
        .submit(InputDescriptor::Url {
            // Reserved TEST-NET-1 address; nothing listens there.
            url: "http://192.0.2.1:9/document".to_string(),
        })
        .await
        .unwrap();
    let job = wait_terminal(&h.runtime, &job_id).await;

    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.is_some());
    assert!(job.result.is_none());
}
