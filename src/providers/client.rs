// HTTP client with retry logic and error handling
// Shared by citation database backends

use crate::providers::{ProviderError, ProviderResult, RetryConfig};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, warn};

pub struct ProviderClient {
    client: Client,
    name: String,
    retry: RetryConfig,
}

impl ProviderClient {
    pub fn new(name: &str, timeout: Duration, retry: RetryConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("CaseStrainer/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(300))
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            client,
            name: name.to_string(),
            retry,
        })
    }

    pub async fn get(&self, url: &str) -> ProviderResult<Response> {
        self.request_with_retry(|| self.client.get(url)).await
    }

    pub async fn get_with_token(&self, url: &str, token: &str) -> ProviderResult<Response> {
        let auth = format!("Token {}", token);
        self.request_with_retry(|| self.client.get(url).header("Authorization", auth.clone()))
            .await
    }

    pub async fn post_form_with_token(
        &self,
        url: &str,
        token: &str,
        form: &[(&str, &str)],
    ) -> ProviderResult<Response> {
        let auth = format!("Token {}", token);
        let form: Vec<(String, String)> = form
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.request_with_retry(|| {
            self.client
                .post(url)
                .header("Authorization", auth.clone())
                .form(&form)
        })
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> ProviderResult<T> {
        let response = self.get(url).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("JSON decode failed: {}", e)))
    }

    /// Execute a request, retrying network errors and 5xx responses with
    /// exponential backoff and jitter. 429 surfaces immediately with the
    /// server's Retry-After so the caller can drain its rate bucket; other
    /// 4xx responses are authoritative and never retried.
    async fn request_with_retry<F>(&self, request_fn: F) -> ProviderResult<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);

        loop {
            attempt += 1;

            debug!("Request attempt {} for {}", attempt, self.name);

            match request_fn().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!("Request successful for {}: {}", self.name, status);
                        return Ok(response);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = parse_retry_after(&response);
                        warn!(
                            "Rate limited by {} (Retry-After: {:?})",
                            self.name, retry_after
                        );
                        return Err(ProviderError::RateLimited { retry_after });
                    }

                    if status.is_server_error() && attempt < self.retry.max_attempts {
                        warn!(
                            "Server error {} for {}, retrying in {:?} (attempt {}/{})",
                            status, self.name, delay, attempt, self.retry.max_attempts
                        );
                        tokio::time::sleep(with_jitter(delay, self.retry.jitter_ms)).await;
                        delay = next_delay(delay, &self.retry);
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    return Err(match status {
                        StatusCode::UNAUTHORIZED => {
                            ProviderError::AuthenticationFailed("Invalid credentials".to_string())
                        }
                        StatusCode::FORBIDDEN => {
                            ProviderError::AuthenticationFailed("Access forbidden".to_string())
                        }
                        StatusCode::NOT_FOUND => ProviderError::NotFound,
                        s if s.is_client_error() => ProviderError::InvalidResponse(format!(
                            "HTTP {}: {}",
                            s,
                            error_text.chars().take(200).collect::<String>()
                        )),
                        s => ProviderError::ServiceUnavailable(format!(
                            "HTTP {}: {}",
                            s,
                            error_text.chars().take(200).collect::<String>()
                        )),
                    });
                }
                Err(e) => {
                    if attempt < self.retry.max_attempts && is_retryable(&e) {
                        warn!(
                            "Network error for {}, retrying in {:?} (attempt {}/{}): {}",
                            self.name, delay, attempt, self.retry.max_attempts, e
                        );
                        tokio::time::sleep(with_jitter(delay, self.retry.jitter_ms)).await;
                        delay = next_delay(delay, &self.retry);
                        continue;
                    }

                    error!(
                        "Request failed for {} after {} attempts: {}",
                        self.name, attempt, e
                    );
                    return Err(ProviderError::Network(e));
                }
            }
        }
    }
}

fn is_retryable(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn next_delay(current: Duration, retry: &RetryConfig) -> Duration {
    Duration::from_millis(
        ((current.as_millis() as f64 * retry.backoff_multiplier) as u64).min(retry.max_delay_ms),
    )
}

/// Add bounded pseudo-random jitter so retries from concurrent tasks spread
/// out. System-clock nanos are random enough here.
fn with_jitter(delay: Duration, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return delay;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    delay + Duration::from_millis(nanos % jitter_ms)
}

/// Parse a delta-seconds Retry-After header. HTTP-date forms are rare on
/// rate-limit responses and fall back to None.
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_doubles_and_caps() {
        let retry = RetryConfig::default();

        let d1 = next_delay(Duration::from_millis(500), &retry);
        assert_eq!(d1, Duration::from_millis(1000));

        let d2 = next_delay(Duration::from_millis(6000), &retry);
        assert_eq!(d2, Duration::from_millis(8000));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(500);
        for _ in 0..50 {
            let jittered = with_jitter(base, 250);
            assert!(jittered >= base);
            assert!(jittered < base + Duration::from_millis(250));
        }
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        let base = Duration::from_millis(500);
        assert_eq!(with_jitter(base, 0), base);
    }
}
