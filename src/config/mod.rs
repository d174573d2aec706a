// Configuration management for CaseStrainer
// Environment-driven settings validated at startup

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use validator::{Validate, ValidationError, ValidationErrors};

/// Complete runtime configuration, read from the environment once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API token for the citation database. Verification is disabled when
    /// absent; extraction and clustering still run.
    pub database_api_key: Option<String>,
    /// Key-value store URL: `sqlite://<path>` or `memory:`.
    pub store_url: String,
    pub bind_addr: String,
    pub worker_concurrency: usize,
    pub verify_concurrency: usize,
    pub rate_limit_per_hour: u32,
    pub rate_limit_burst: u32,
    pub job_timeout_seconds: u64,
    pub visibility_timeout_seconds: u64,
    pub stall_timeout_seconds: u64,
    /// Submissions at or below this size run synchronously on the request
    /// path, without verification.
    pub sync_threshold_bytes: usize,
    pub http_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_api_key: None,
            store_url: "memory:".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            worker_concurrency: 2,
            verify_concurrency: 8,
            rate_limit_per_hour: 100,
            rate_limit_burst: 10,
            job_timeout_seconds: 1200,
            visibility_timeout_seconds: 600,
            stall_timeout_seconds: 120,
            sync_threshold_bytes: 2048,
            http_timeout_seconds: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults for
    /// anything unset. Fails on unparseable values rather than silently
    /// misconfiguring the service.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database_api_key: read_optional("DATABASE_API_KEY"),
            store_url: read_optional("REDIS_URL").unwrap_or(defaults.store_url),
            bind_addr: read_optional("BIND_ADDR").unwrap_or(defaults.bind_addr),
            worker_concurrency: read_parsed("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            verify_concurrency: read_parsed("VERIFY_CONCURRENCY", defaults.verify_concurrency)?,
            rate_limit_per_hour: read_parsed("RATE_LIMIT_PER_HOUR", defaults.rate_limit_per_hour)?,
            rate_limit_burst: read_parsed("RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            job_timeout_seconds: read_parsed("JOB_TIMEOUT_SECONDS", defaults.job_timeout_seconds)?,
            visibility_timeout_seconds: read_parsed(
                "VISIBILITY_TIMEOUT_SECONDS",
                defaults.visibility_timeout_seconds,
            )?,
            stall_timeout_seconds: read_parsed(
                "STALL_TIMEOUT_SECONDS",
                defaults.stall_timeout_seconds,
            )?,
            sync_threshold_bytes: read_parsed(
                "SYNC_THRESHOLD_BYTES",
                defaults.sync_threshold_bytes,
            )?,
            http_timeout_seconds: read_parsed(
                "HTTP_TIMEOUT_SECONDS",
                defaults.http_timeout_seconds,
            )?,
        };

        config
            .validate()
            .context("Configuration validation failed")?;

        if config.database_api_key.is_none() {
            warn!("DATABASE_API_KEY not set; citation verification is disabled");
        }
        info!(
            store = %config.store_url,
            workers = config.worker_concurrency,
            rate_limit = config.rate_limit_per_hour,
            "Configuration loaded"
        );

        Ok(config)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.store_url.is_empty() {
            errors.add("store_url", ValidationError::new("required"));
        } else if !self.store_url.starts_with("sqlite:") && self.store_url != "memory:" {
            errors.add("store_url", ValidationError::new("unsupported_scheme"));
        }

        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.add("bind_addr", ValidationError::new("invalid_addr"));
        }

        if self.worker_concurrency == 0 {
            errors.add("worker_concurrency", ValidationError::new("min_value"));
        }

        if self.verify_concurrency == 0 {
            errors.add("verify_concurrency", ValidationError::new("min_value"));
        }

        if self.rate_limit_per_hour == 0 {
            errors.add("rate_limit_per_hour", ValidationError::new("min_value"));
        }

        if self.job_timeout_seconds == 0 {
            errors.add("job_timeout_seconds", ValidationError::new("min_value"));
        }

        if self.stall_timeout_seconds == 0 {
            errors.add("stall_timeout_seconds", ValidationError::new("min_value"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn read_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", name, e)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = AppConfig {
            worker_concurrency: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_store_scheme_rejected() {
        let config = AppConfig {
            store_url: "postgres://localhost/db".to_string(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sqlite_store_accepted() {
        let config = AppConfig {
            store_url: "sqlite:///tmp/casestrainer.db".to_string(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
