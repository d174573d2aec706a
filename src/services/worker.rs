// Job worker for CaseStrainer
// Claims queued jobs, runs the pipeline with progress reporting, fans out
// verification, and enforces stall and wall-clock limits

use crate::domain::{
    Cluster, Job, JobResult, JobState, JobStep, ResultMetadata, VerificationStatus,
};
use crate::services::cache::CitationCache;
use crate::services::job_runtime::{
    cancel_key, job_key, queue_key, JobRuntime, MAX_JOB_ATTEMPTS,
};
use crate::services::pipeline::PipelineOutput;
use chrono::Utc;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

enum JobFailure {
    Cancelled,
    Failed(String),
}

/// Worker loop: wake on queue signals or a poll tick, then drain claimable
/// jobs one at a time. A job is processed by exactly one worker; claims
/// expire after the visibility timeout so a dead worker's job is retried.
pub async fn run_worker(runtime: Arc<JobRuntime>, worker_id: usize) {
    info!("Worker {} started", worker_id);

    loop {
        tokio::select! {
            _ = runtime.queue_notify.notified() => {}
            _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
        }

        while let Some(job) = claim_next(&runtime).await {
            let job_id = job.job_id.clone();
            debug!("Worker {} claimed job {}", worker_id, job_id);
            run_job(&runtime, job).await;
            debug!("Worker {} finished job {}", worker_id, job_id);
        }
    }
}

/// Claim the next eligible queue entry with a single compare-and-swap per
/// candidate; losing the race just moves on to the next key.
async fn claim_next(runtime: &Arc<JobRuntime>) -> Option<Job> {
    let ids = match runtime.queued_job_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Queue scan failed: {}", e);
            return None;
        }
    };

    for job_id in ids {
        if runtime.cancel_requested(&job_id).await {
            finalize_cancelled(runtime, &job_id).await;
            continue;
        }

        let raw = match runtime.store.get(&job_key(&job_id)).await {
            Ok(Some(raw)) => raw,
            _ => {
                // Orphaned queue entry.
                let _ = runtime.store.delete(&queue_key(&job_id)).await;
                continue;
            }
        };
        let Some(job) = crate::services::cache::decode_versioned::<Job>(&raw) else {
            let _ = runtime.store.delete(&queue_key(&job_id)).await;
            continue;
        };

        let claim_expired = job
            .claim_expires_at
            .map_or(true, |at| at <= Utc::now());

        let eligible = match job.state {
            JobState::Queued => true,
            JobState::Running => claim_expired,
            _ => {
                let _ = runtime.store.delete(&queue_key(&job_id)).await;
                continue;
            }
        };
        if !eligible {
            continue;
        }

        if job.attempt >= MAX_JOB_ATTEMPTS {
            finalize_failed(
                runtime,
                &job_id,
                format!("claim expired after {} attempts", job.attempt),
            )
            .await;
            continue;
        }

        let mut claimed = job.clone();
        claimed.state = JobState::Running;
        claimed.attempt += 1;
        claimed.claim_expires_at = Some(
            Utc::now()
                + chrono::Duration::from_std(runtime.config.visibility_timeout())
                    .unwrap_or_else(|_| chrono::Duration::seconds(600)),
        );
        claimed.updated_at = Utc::now();

        let encoded = match crate::services::cache::encode_versioned(&claimed) {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to encode claim for {}: {}", job_id, e);
                continue;
            }
        };
        match runtime
            .store
            .put_if(&job_key(&job_id), &encoded, Some(&raw), None)
            .await
        {
            Ok(true) => return Some(claimed),
            Ok(false) => continue, // another worker won
            Err(e) => {
                warn!("Claim write failed for {}: {}", job_id, e);
                continue;
            }
        }
    }

    None
}

#[instrument(skip(runtime, job), fields(job_id = %job.job_id))]
async fn run_job(runtime: &Arc<JobRuntime>, job: Job) {
    let job_id = job.job_id.clone();
    let cancel = CancellationToken::new();
    runtime
        .running
        .lock()
        .await
        .insert(job_id.clone(), cancel.clone());

    let last_touch = Arc::new(StdMutex::new(Instant::now()));
    let abort_reason: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let watchdog = spawn_watchdog(
        runtime,
        &job_id,
        cancel.clone(),
        Arc::clone(&last_touch),
        Arc::clone(&abort_reason),
    );

    let outcome = execute(runtime, &job, &cancel, &last_touch).await;

    watchdog.abort();
    runtime.running.lock().await.remove(&job_id);

    let forced = abort_reason.lock().unwrap().take();
    match (outcome, forced) {
        // Watchdog abort outranks the cooperative-cancel outcome it caused.
        (Err(JobFailure::Cancelled), Some(reason)) | (Err(JobFailure::Failed(_)), Some(reason)) => {
            finalize_failed(runtime, &job_id, reason).await;
        }
        (Ok(result), _) => finalize_completed(runtime, &job_id, result).await,
        (Err(JobFailure::Cancelled), None) => finalize_cancelled(runtime, &job_id).await,
        (Err(JobFailure::Failed(reason)), None) => {
            finalize_failed(runtime, &job_id, reason).await;
        }
    }
}

/// Watchdog: fails the job when no stage progress lands for the stall
/// window, when the wall clock budget runs out, or when a cancel flag
/// appears from another process.
fn spawn_watchdog(
    runtime: &Arc<JobRuntime>,
    job_id: &str,
    cancel: CancellationToken,
    last_touch: Arc<StdMutex<Instant>>,
    abort_reason: Arc<StdMutex<Option<String>>>,
) -> tokio::task::JoinHandle<()> {
    let runtime = Arc::clone(runtime);
    let job_id = job_id.to_string();
    let started = Instant::now();

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(WATCHDOG_INTERVAL).await;
            if cancel.is_cancelled() {
                return;
            }

            let idle = last_touch.lock().unwrap().elapsed();
            if idle >= runtime.config.stall_timeout() {
                warn!("Job {} stalled ({}s without progress)", job_id, idle.as_secs());
                *abort_reason.lock().unwrap() = Some("stalled".to_string());
                cancel.cancel();
                return;
            }

            if started.elapsed() >= runtime.config.job_timeout() {
                warn!("Job {} exceeded wall-clock budget", job_id);
                *abort_reason.lock().unwrap() = Some("timeout".to_string());
                cancel.cancel();
                return;
            }

            if matches!(runtime.store.get(&cancel_key(&job_id)).await, Ok(Some(_))) {
                info!("Cancel flag observed for running job {}", job_id);
                cancel.cancel();
                return;
            }
        }
    })
}

async fn execute(
    runtime: &Arc<JobRuntime>,
    job: &Job,
    cancel: &CancellationToken,
    last_touch: &Arc<StdMutex<Instant>>,
) -> Result<JobResult, JobFailure> {
    let job_id = &job.job_id;
    let job_started = Instant::now();
    let touch = || *last_touch.lock().unwrap() = Instant::now();

    // Load the document. The fetch is a suspension point: cancellation and
    // the watchdog both interrupt it.
    let text = tokio::select! {
        loaded = runtime.loader.load(&job.input_descriptor) => {
            loaded.map_err(|e| JobFailure::Failed(e.to_string()))?
        }
        _ = cancel.cancelled() => return Err(JobFailure::Cancelled),
    };
    touch();
    check_cancel(runtime, job_id, cancel).await?;

    // Synchronous stages, short-circuited by the extraction cache.
    let text_hash = CitationCache::text_hash(&text);
    let mut output = match runtime.cache.get_extraction(&text_hash).await {
        Some(cached) => {
            debug!("Extraction cache hit for job {}", job_id);
            report_progress(runtime, job_id, job_started, JobStep::Verification, 0.0, cached.occurrences.len(), 0).await;
            cached
        }
        None => {
            report_progress(runtime, job_id, job_started, JobStep::Extraction, 0.0, 0, 0).await;
            let stage_started = Instant::now();
            let extraction = runtime.pipeline.extract(&text);
            let extraction_seconds = stage_started.elapsed().as_secs_f64();
            touch();
            report_progress(
                runtime,
                job_id,
                job_started,
                JobStep::NameExtraction,
                0.0,
                extraction.occurrences.len(),
                0,
            )
            .await;
            check_cancel(runtime, job_id, cancel).await?;

            let stage_started = Instant::now();
            let names = runtime.pipeline.extract_names(&text, &extraction);
            let name_extraction_seconds = stage_started.elapsed().as_secs_f64();
            touch();
            report_progress(
                runtime,
                job_id,
                job_started,
                JobStep::Clustering,
                0.0,
                extraction.occurrences.len(),
                0,
            )
            .await;
            check_cancel(runtime, job_id, cancel).await?;

            let stage_started = Instant::now();
            let clusters = runtime
                .pipeline
                .cluster(&text, &extraction.occurrences, &names);
            let clustering_seconds = stage_started.elapsed().as_secs_f64();
            touch();

            let statutes_excluded = extraction
                .occurrences
                .iter()
                .filter(|o| !o.is_case())
                .count();
            let output = PipelineOutput {
                occurrences: extraction.occurrences,
                names,
                clusters,
                statutes_excluded,
                warnings: extraction.warnings,
                timing: crate::domain::StepTiming {
                    extraction_seconds,
                    name_extraction_seconds,
                    clustering_seconds,
                    verification_seconds: 0.0,
                },
            };

            if let Err(e) = runtime.cache.put_extraction(&text_hash, &output).await {
                warn!("Failed to cache extraction for {}: {}", job_id, e);
            }
            output
        }
    };

    let total_citations = output.occurrences.len();
    report_progress(
        runtime,
        job_id,
        job_started,
        JobStep::Verification,
        0.0,
        total_citations,
        0,
    )
    .await;
    check_cancel(runtime, job_id, cancel).await?;

    // Verification fan-out, bounded by the semaphore and the rate bucket.
    let verification_started = Instant::now();
    if let Some(verifier) = runtime.verifier.as_ref().filter(|_| !output.clusters.is_empty()) {
        let semaphore = Arc::new(Semaphore::new(runtime.config.verify_concurrency));
        let mut tasks: JoinSet<(usize, Cluster, bool)> = JoinSet::new();

        for (index, cluster) in output.clusters.iter().cloned().enumerate() {
            let verifier = Arc::clone(verifier);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let mut cluster = cluster;
                if cancel.is_cancelled() {
                    return (index, cluster, false);
                }
                let completed = verifier.verify_cluster(&mut cluster, &cancel).await;
                (index, cluster, completed)
            });
        }

        let total_clusters = output.clusters.len();
        let mut verified_clusters = 0usize;
        let mut processed_citations = 0usize;
        // Rate-limit starvation is a legitimate suspension, not a stall;
        // keep the watchdog fed while verifications queue for tokens.
        let mut heartbeat = tokio::time::interval(Duration::from_secs(30));

        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = heartbeat.tick() => {
                    touch();
                    continue;
                }
            };
            let Some(joined) = joined else {
                break;
            };
            let Ok((index, cluster, completed)) = joined else {
                return Err(JobFailure::Failed("verification task panicked".to_string()));
            };
            if cancel.is_cancelled() {
                // Dropping the set aborts whatever is still in flight;
                // results of a cancelled job are discarded.
                return Err(JobFailure::Cancelled);
            }
            if completed {
                processed_citations += cluster.occurrences.len();
                output.clusters[index] = cluster;
                verified_clusters += 1;
                touch();
                report_progress(
                    runtime,
                    job_id,
                    job_started,
                    JobStep::Verification,
                    verified_clusters as f64 / total_clusters as f64,
                    total_citations,
                    processed_citations,
                )
                .await;
            }
        }
    } else if runtime.verifier.is_none() && !output.clusters.is_empty() {
        output
            .warnings
            .push("verification skipped: no citation database configured".to_string());
    }

    check_cancel(runtime, job_id, cancel).await?;
    output.timing.verification_seconds = verification_started.elapsed().as_secs_f64();

    // Stable order regardless of verification completion order.
    output.clusters.sort_by_key(|c| c.earliest_offset());

    Ok(build_result(output))
}

async fn check_cancel(
    runtime: &Arc<JobRuntime>,
    job_id: &str,
    cancel: &CancellationToken,
) -> Result<(), JobFailure> {
    if cancel.is_cancelled() || runtime.cancel_requested(job_id).await {
        return Err(JobFailure::Cancelled);
    }
    Ok(())
}

fn build_result(output: PipelineOutput) -> JobResult {
    let mut metadata = ResultMetadata {
        total: output.occurrences.len(),
        total_clusters: output.clusters.len(),
        statutes_excluded: output.statutes_excluded,
        warnings: output.warnings.clone(),
        ..ResultMetadata::default()
    };
    for cluster in &output.clusters {
        match cluster.verification_status {
            VerificationStatus::Verified => metadata.verified += 1,
            VerificationStatus::VerifiedByParallel => metadata.verified_by_parallel += 1,
            VerificationStatus::Unverified => metadata.unverified += 1,
            VerificationStatus::Failed => metadata.failed += 1,
        }
    }

    JobResult {
        clusters: output.clusters,
        citations: output.occurrences,
        metadata,
        timing: output.timing,
    }
}

/// Write a progress update with the step's weighted share and an ETA from
/// the observed processing rate, floored at one second.
async fn report_progress(
    runtime: &Arc<JobRuntime>,
    job_id: &str,
    job_started: Instant,
    step: JobStep,
    step_fraction: f64,
    total_citations: usize,
    processed_citations: usize,
) {
    let step_fraction = step_fraction.clamp(0.0, 1.0);
    let overall =
        step.completed_weight_before() as f64 + step.weight() as f64 * step_fraction;
    let progress = overall.round().min(100.0) as u8;

    let elapsed = job_started.elapsed().as_secs_f64();
    let eta_seconds = if overall > 0.0 && elapsed > 0.0 {
        let rate = overall / elapsed; // weight units per second
        Some(((100.0 - overall) / rate).max(1.0).round() as u64)
    } else {
        None
    };

    let visibility = chrono::Duration::from_std(runtime.config.visibility_timeout())
        .unwrap_or_else(|_| chrono::Duration::seconds(600));
    let result = runtime
        .update_job(job_id, |job| {
            job.state = JobState::Running;
            job.current_step = step;
            job.progress = progress;
            job.eta_seconds = eta_seconds;
            job.total_citations = total_citations;
            job.processed_citations = processed_citations;
            // Each progress write renews the claim so a live worker never
            // has its job stolen mid-run.
            job.claim_expires_at = Some(Utc::now() + visibility);
        })
        .await;
    if let Err(e) = result {
        warn!("Progress write failed for {}: {}", job_id, e);
    }
}

async fn finalize_completed(runtime: &Arc<JobRuntime>, job_id: &str, result: JobResult) {
    let updated = runtime
        .update_job(job_id, |job| {
            job.state = JobState::Completed;
            job.current_step = JobStep::Done;
            job.progress = 100;
            job.eta_seconds = Some(0);
            job.total_citations = result.metadata.total;
            job.processed_citations = result.metadata.total;
            job.result = Some(result.clone());
            job.error = None;
        })
        .await;

    match updated {
        Ok(job) => {
            if let Err(e) = runtime.persist_terminal(&job).await {
                error!("Failed to persist completed job {}: {}", job_id, e);
            }
            info!("Job {} completed", job_id);
        }
        Err(e) => error!("Failed to finalize job {}: {}", job_id, e),
    }
}

async fn finalize_cancelled(runtime: &Arc<JobRuntime>, job_id: &str) {
    let updated = runtime
        .update_job(job_id, |job| {
            job.state = JobState::Cancelled;
            job.eta_seconds = None;
            // No partial results for cancelled jobs.
            job.result = None;
        })
        .await;

    match updated {
        Ok(job) => {
            if let Err(e) = runtime.persist_terminal(&job).await {
                error!("Failed to persist cancelled job {}: {}", job_id, e);
            }
            info!("Job {} cancelled", job_id);
        }
        Err(e) => error!("Failed to cancel job {}: {}", job_id, e),
    }
}

async fn finalize_failed(runtime: &Arc<JobRuntime>, job_id: &str, reason: String) {
    let updated = runtime
        .update_job(job_id, |job| {
            job.state = JobState::Failed;
            job.eta_seconds = None;
            job.result = None;
            job.error = Some(reason.clone());
        })
        .await;

    match updated {
        Ok(job) => {
            if let Err(e) = runtime.persist_terminal(&job).await {
                error!("Failed to persist failed job {}: {}", job_id, e);
            }
            warn!("Job {} failed: {}", job_id, reason);
        }
        Err(e) => error!("Failed to fail job {}: {}", job_id, e),
    }
}
