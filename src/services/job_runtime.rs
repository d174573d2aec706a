// Job runtime for CaseStrainer
// Submission, status, cancellation, and the claim-based shared queue

use crate::config::AppConfig;
use crate::domain::{InputDescriptor, Job, JobState};
use crate::services::cache::{
    decode_versioned, encode_versioned, CitationCache, KeyValueStore, StoreError, JOBS_PREFIX,
};
use crate::services::loader::DocumentLoader;
use crate::services::pipeline::CitationPipeline;
use crate::services::verifier::Verifier;
use crate::services::worker;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Terminal job records stay readable for at least 24 hours; 48 gives slack
/// for clients that poll slowly.
pub const TERMINAL_JOB_TTL: Duration = Duration::from_secs(48 * 3600);

/// Queue claim retry cap: one initial delivery plus two redeliveries.
pub const MAX_JOB_ATTEMPTS: u32 = 3;

pub const QUEUE_PREFIX: &str = "queue/";
pub const CANCEL_PREFIX: &str = "cancel/";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobRuntime {
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) loader: Arc<dyn DocumentLoader>,
    pub(crate) pipeline: Arc<CitationPipeline>,
    pub(crate) verifier: Option<Arc<Verifier>>,
    pub(crate) cache: Arc<CitationCache>,
    pub(crate) config: AppConfig,
    pub(crate) queue_notify: Arc<Notify>,
    pub(crate) running: Mutex<HashMap<String, CancellationToken>>,
}

impl JobRuntime {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        loader: Arc<dyn DocumentLoader>,
        pipeline: Arc<CitationPipeline>,
        verifier: Option<Arc<Verifier>>,
        cache: Arc<CitationCache>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            loader,
            pipeline,
            verifier,
            cache,
            config,
            queue_notify: Arc::new(Notify::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the worker pool and the hourly cache compaction loop.
    pub fn start(self: &Arc<Self>) {
        info!(
            "Starting job runtime with {} workers",
            self.config.worker_concurrency
        );

        for worker_id in 0..self.config.worker_concurrency {
            let runtime = Arc::clone(self);
            tokio::spawn(async move {
                worker::run_worker(runtime, worker_id).await;
            });
        }

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                if let Err(e) = runtime.cache.compact().await {
                    warn!("Cache compaction failed: {}", e);
                }
            }
        });
    }

    /// Validate a submission and enqueue it. Validation failures surface
    /// synchronously; everything downstream is the worker's problem.
    #[instrument(skip(self, descriptor), fields(kind = descriptor.kind()))]
    pub async fn submit(&self, descriptor: InputDescriptor) -> Result<String, JobError> {
        validate_descriptor(&descriptor)?;

        let job_id = Uuid::new_v4().to_string();
        let job = Job::new(job_id.clone(), descriptor);

        let raw = encode_versioned(&job)?;
        if !self
            .store
            .put_if(&job_key(&job_id), &raw, None, None)
            .await?
        {
            // v4 collisions do not happen; a hit means the store is corrupt.
            return Err(JobError::InvalidInput("job id collision".to_string()));
        }

        self.store
            .put(&queue_key(&job_id), &Utc::now().to_rfc3339(), None)
            .await?;
        self.queue_notify.notify_one();

        info!("Submitted job {}", job_id);
        Ok(job_id)
    }

    pub async fn status(&self, job_id: &str) -> Result<Job, JobError> {
        let raw = self
            .store
            .get(&job_key(job_id))
            .await?
            .ok_or(JobError::NotFound)?;
        decode_versioned(&raw).ok_or(JobError::NotFound)
    }

    /// Request cancellation. Queued jobs flip immediately; running jobs get
    /// a cooperative signal honored at the next suspension point. Returns
    /// false when the job is already terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<bool, JobError> {
        let job = self.status(job_id).await?;
        if job.state.is_terminal() {
            return Ok(false);
        }

        // Durable flag for workers in other processes.
        self.store
            .put(&cancel_key(job_id), "1", Some(TERMINAL_JOB_TTL))
            .await?;

        if let Some(token) = self.running.lock().await.get(job_id) {
            token.cancel();
        }

        if job.state == JobState::Queued {
            // Flip directly so the worker never picks it up.
            let flipped = self
                .update_job(job_id, |job| {
                    if job.state == JobState::Queued {
                        job.state = JobState::Cancelled;
                    }
                })
                .await?;
            if flipped.state == JobState::Cancelled {
                self.store.delete(&queue_key(job_id)).await?;
                self.persist_terminal(&flipped).await?;
            }
        }

        info!("Cancellation requested for job {}", job_id);
        Ok(true)
    }

    pub async fn cancel_requested(&self, job_id: &str) -> bool {
        matches!(self.store.get(&cancel_key(job_id)).await, Ok(Some(_)))
    }

    /// Read-modify-write with optimistic concurrency on the serialized
    /// record. Progress never decreases and terminal states never regress.
    pub(crate) async fn update_job<F>(&self, job_id: &str, mutate: F) -> Result<Job, JobError>
    where
        F: Fn(&mut Job),
    {
        loop {
            let raw = self
                .store
                .get(&job_key(job_id))
                .await?
                .ok_or(JobError::NotFound)?;
            let current: Job = decode_versioned(&raw).ok_or(JobError::NotFound)?;

            if current.state.is_terminal() {
                return Ok(current);
            }

            let mut updated = current.clone();
            mutate(&mut updated);
            updated.progress = updated.progress.max(current.progress);
            updated.updated_at = Utc::now();

            let encoded = encode_versioned(&updated)?;
            if self
                .store
                .put_if(&job_key(job_id), &encoded, Some(&raw), None)
                .await?
            {
                return Ok(updated);
            }
            debug!("Concurrent job update for {}, retrying", job_id);
        }
    }

    /// Re-write a terminal record with its retention TTL and drop the queue
    /// and cancel markers.
    pub(crate) async fn persist_terminal(&self, job: &Job) -> Result<(), JobError> {
        let encoded = encode_versioned(job)?;
        self.store
            .put(&job_key(&job.job_id), &encoded, Some(TERMINAL_JOB_TTL))
            .await?;
        self.store.delete(&queue_key(&job.job_id)).await?;
        Ok(())
    }

    /// Current queue keys in stable order; used by workers to claim work.
    pub(crate) async fn queued_job_ids(&self) -> Result<Vec<String>, JobError> {
        let keys = self.store.scan_prefix(QUEUE_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(QUEUE_PREFIX).map(str::to_string))
            .collect())
    }
}

pub(crate) fn job_key(job_id: &str) -> String {
    format!("{}{}", JOBS_PREFIX, job_id)
}

pub(crate) fn queue_key(job_id: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, job_id)
}

pub(crate) fn cancel_key(job_id: &str) -> String {
    format!("{}{}", CANCEL_PREFIX, job_id)
}

fn validate_descriptor(descriptor: &InputDescriptor) -> Result<(), JobError> {
    match descriptor {
        InputDescriptor::Text { text } => {
            if text.trim().is_empty() {
                return Err(JobError::InvalidInput("text is empty".to_string()));
            }
        }
        InputDescriptor::Url { url } => {
            let parsed = url::Url::parse(url)
                .map_err(|e| JobError::InvalidInput(format!("invalid URL: {}", e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(JobError::InvalidInput(format!(
                    "unsupported URL scheme: {}",
                    parsed.scheme()
                )));
            }
        }
        InputDescriptor::File { name, text } => {
            let lower = name.to_lowercase();
            if lower.ends_with(".pdf") || lower.ends_with(".docx") || lower.ends_with(".doc") {
                return Err(JobError::InvalidInput(format!(
                    "unsupported file type: {}",
                    name
                )));
            }
            if text.trim().is_empty() {
                return Err(JobError::InvalidInput("file is empty".to_string()));
            }
        }
    }
    Ok(())
}
