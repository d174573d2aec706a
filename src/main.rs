// CaseStrainer server binary
// Wires configuration, storage, providers, workers, and the HTTP API

use anyhow::{Context, Result};
use casestrainer::api::{create_api_server, ApiState};
use casestrainer::config::AppConfig;
use casestrainer::providers::courtlistener::CourtListenerProvider;
use casestrainer::providers::rate_limiter::RateLimiter;
use casestrainer::providers::{CitationDatabase, RateLimitConfig, RetryConfig};
use casestrainer::services::cache::{open_store, CitationCache};
use casestrainer::services::job_runtime::JobRuntime;
use casestrainer::services::loader::StandardLoader;
use casestrainer::services::pipeline::CitationPipeline;
use casestrainer::services::verifier::Verifier;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "casestrainer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting CaseStrainer");

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let store = open_store(&config.store_url)
        .await
        .context("Failed to open key-value store")?;
    let cache = Arc::new(CitationCache::new(Arc::clone(&store)));
    let pipeline = Arc::new(CitationPipeline::new());
    let loader = Arc::new(StandardLoader::new(config.http_timeout()));

    let verifier = match &config.database_api_key {
        Some(api_key) => {
            let database: Arc<dyn CitationDatabase> = Arc::new(
                CourtListenerProvider::new(
                    api_key.clone(),
                    config.http_timeout(),
                    RetryConfig::default(),
                )
                .context("Failed to construct citation database client")?,
            );
            let rate_limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
                requests_per_hour: config.rate_limit_per_hour,
                burst_limit: config.rate_limit_burst,
            }));
            Some(Arc::new(Verifier::new(
                database,
                Arc::clone(&cache),
                rate_limiter,
            )))
        }
        None => None,
    };
    let database_configured = verifier.is_some();

    let runtime = Arc::new(JobRuntime::new(
        Arc::clone(&store),
        loader,
        Arc::clone(&pipeline),
        verifier,
        Arc::clone(&cache),
        config.clone(),
    ));
    runtime.start();

    let state = Arc::new(ApiState {
        runtime,
        pipeline,
        cache,
        store,
        config: config.clone(),
        database_configured,
    });
    let app = create_api_server(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
