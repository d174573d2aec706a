// REST API server for CaseStrainer
// Job submission, status polling, health, and cache administration

use crate::config::AppConfig;
use crate::domain::{InputDescriptor, Job, JobState, ResultMetadata};
use crate::services::cache::{CitationCache, KeyValueStore};
use crate::services::job_runtime::{JobError, JobRuntime};
use crate::services::pipeline::CitationPipeline;
use axum::{
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// API models
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncAnalyzeResponse {
    pub citations: Vec<crate::domain::CitationOccurrence>,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: JobState,
    pub progress: u8,
    pub current_step: crate::domain::JobStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub total_citations: usize,
    pub processed_citations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<crate::domain::JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub cleared: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Router
// ============================================================================

pub struct ApiState {
    pub runtime: Arc<JobRuntime>,
    pub pipeline: Arc<CitationPipeline>,
    pub cache: Arc<CitationCache>,
    pub store: Arc<dyn KeyValueStore>,
    pub config: AppConfig,
    pub database_configured: bool,
}

pub fn create_api_server(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/analyze", post(analyze))
        .route("/api/task_status/:job_id", get(task_status))
        .route("/api/health", get(health))
        .route("/api/cache/clear-unverified", post(clear_unverified))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Route handlers
// ============================================================================

#[instrument(skip(state, request))]
async fn analyze(State(state): State<Arc<ApiState>>, request: Request) -> Response {
    let descriptor = match parse_submission(request).await {
        Ok(descriptor) => descriptor,
        Err(message) => return bad_request(message),
    };

    // Small pasted texts run inline, without verification; everything else
    // goes through the job queue so the rate budget has one owner.
    if let InputDescriptor::Text { text } = &descriptor {
        if text.trim().is_empty() {
            return bad_request("text is empty".to_string());
        }
        if text.len() <= state.config.sync_threshold_bytes {
            debug!("Running synchronous analysis ({} bytes)", text.len());
            let output = state.pipeline.run(text);

            let metadata = ResultMetadata {
                total: output.occurrences.len(),
                total_clusters: output.clusters.len(),
                unverified: output.clusters.len(),
                statutes_excluded: output.statutes_excluded,
                warnings: output.warnings,
                ..ResultMetadata::default()
            };
            return (
                StatusCode::OK,
                Json(SyncAnalyzeResponse {
                    citations: output.occurrences,
                    metadata,
                }),
            )
                .into_response();
        }
    }

    match state.runtime.submit(descriptor).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(QueuedResponse { job_id })).into_response(),
        Err(JobError::InvalidInput(message)) => bad_request(message),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn task_status(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
) -> Response {
    match state.runtime.status(&job_id).await {
        Ok(job) => (StatusCode::OK, Json(status_response(job))).into_response(),
        Err(JobError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "unknown job id".to_string(),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let store_ok = state.store.health_check().await.is_ok();
    if !store_ok {
        warn!("Health check: key-value store unreachable");
    }

    // No database token means verification is off; that is a degraded
    // service, not a broken one.
    let status = if store_ok && state.database_configured {
        "healthy"
    } else {
        "degraded"
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
        .into_response()
}

async fn clear_unverified(State(state): State<Arc<ApiState>>) -> Response {
    match state.cache.clear_unverified().await {
        Ok(cleared) => {
            info!("Cleared {} unverified cache entries via API", cleared);
            (StatusCode::OK, Json(ClearedResponse { cleared })).into_response()
        }
        Err(e) => internal_error(e.to_string()),
    }
}

// ============================================================================
// Request parsing
// ============================================================================

/// Accept either a JSON body or a multipart upload and produce an input
/// descriptor. Unknown fields and shapes are rejected at this boundary.
async fn parse_submission(request: Request) -> Result<InputDescriptor, String> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| format!("invalid multipart body: {}", e))?;
        return parse_multipart(multipart).await;
    }

    let Json(body): Json<AnalyzeRequest> = Json::from_request(request, &())
        .await
        .map_err(|e| format!("invalid JSON body: {}", e))?;

    match body.kind.as_str() {
        "text" => {
            let text = body.text.ok_or("missing field: text")?;
            Ok(InputDescriptor::Text { text })
        }
        "url" => {
            let url = body.url.ok_or("missing field: url")?;
            Ok(InputDescriptor::Url { url })
        }
        other => Err(format!("unsupported submission type: {}", other)),
    }
}

async fn parse_multipart(mut multipart: Multipart) -> Result<InputDescriptor, String> {
    let mut kind: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("invalid multipart field: {}", e))?
    {
        match field.name() {
            Some("type") => {
                kind = Some(field.text().await.map_err(|e| e.to_string())?);
            }
            Some("file") => {
                let name = field
                    .file_name()
                    .unwrap_or("upload.txt")
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| e.to_string())?.to_vec();
                file = Some((name, bytes));
            }
            _ => {}
        }
    }

    if let Some(kind) = kind {
        if kind != "file" {
            return Err(format!("unsupported submission type: {}", kind));
        }
    }

    let (name, bytes) = file.ok_or("missing field: file")?;
    // Decode at the boundary; a job record must carry runnable text.
    let text = String::from_utf8(bytes)
        .map_err(|_| format!("decode failed: {} is not valid UTF-8", name))?;
    Ok(InputDescriptor::File { name, text })
}

fn status_response(job: Job) -> StatusResponse {
    StatusResponse {
        status: job.state,
        progress: job.progress,
        current_step: job.current_step,
        eta_seconds: job.eta_seconds,
        total_citations: job.total_citations,
        processed_citations: job.processed_citations,
        results: job.result,
        error: job.error,
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: message }),
    )
        .into_response()
}

fn internal_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: message }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response_shape() {
        let job = Job::new(
            "j1".to_string(),
            InputDescriptor::Text {
                text: "410 U.S. 113".to_string(),
            },
        );
        let response = status_response(job);
        assert_eq!(response.status, JobState::Queued);
        assert_eq!(response.progress, 0);
        assert!(response.results.is_none());
        assert!(response.error.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("results").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_analyze_request_parses() {
        let body: AnalyzeRequest =
            serde_json::from_str(r#"{"type": "text", "text": "410 U.S. 113"}"#).unwrap();
        assert_eq!(body.kind, "text");
        assert_eq!(body.text.as_deref(), Some("410 U.S. 113"));

        let body: AnalyzeRequest =
            serde_json::from_str(r#"{"type": "url", "url": "https://example.com"}"#).unwrap();
        assert_eq!(body.kind, "url");
    }
}
