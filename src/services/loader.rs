// Document loading for CaseStrainer
// Turns a submission descriptor into UTF-8 plain text with normalized line
// endings; PDF/DOCX decoding stays behind this seam

use crate::domain::InputDescriptor;
use crate::utils::text::normalize_line_endings;
use async_trait::async_trait;
use scraper::{ElementRef, Html};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Unsupported input type: {0}")]
    UnsupportedType(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Document is empty")]
    EmptyDocument,
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, descriptor: &InputDescriptor) -> Result<String, LoaderError>;
}

pub struct StandardLoader {
    client: reqwest::Client,
}

impl StandardLoader {
    pub fn new(http_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("CaseStrainer/", env!("CARGO_PKG_VERSION")))
            .timeout(http_timeout)
            .build()
            .expect("HTTP client construction");

        Self { client }
    }

    async fn load_url(&self, url: &str) -> Result<String, LoaderError> {
        info!("Fetching document from {}", url);

        let parsed = url::Url::parse(url)
            .map_err(|e| LoaderError::UnsupportedType(format!("invalid URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LoaderError::UnsupportedType(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LoaderError::FetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LoaderError::FetchFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain")
            .to_lowercase();

        let body = response
            .text()
            .await
            .map_err(|e| LoaderError::DecodeFailed(e.to_string()))?;

        let text = if content_type.contains("text/html") {
            debug!("Extracting text from HTML document ({} bytes)", body.len());
            html_to_text(&body)
        } else if content_type.contains("text/") || content_type.contains("json") {
            body
        } else {
            return Err(LoaderError::UnsupportedType(format!(
                "content type {}",
                content_type
            )));
        };

        Ok(text)
    }

    fn load_file(&self, name: &str, text: &str) -> Result<String, LoaderError> {
        let lower = name.to_lowercase();
        if lower.ends_with(".pdf") || lower.ends_with(".docx") || lower.ends_with(".doc") {
            // Binary decoding is the platform's concern; this service only
            // accepts text it can read directly.
            warn!("Rejected binary document {}", name);
            return Err(LoaderError::UnsupportedType(format!(
                "binary document format: {}",
                name
            )));
        }
        Ok(text.to_string())
    }
}

#[async_trait]
impl DocumentLoader for StandardLoader {
    #[instrument(skip(self, descriptor), fields(kind = descriptor.kind()))]
    async fn load(&self, descriptor: &InputDescriptor) -> Result<String, LoaderError> {
        let text = match descriptor {
            InputDescriptor::Text { text } => text.clone(),
            InputDescriptor::Url { url } => self.load_url(url).await?,
            InputDescriptor::File { name, text } => self.load_file(name, text)?,
        };

        let text = normalize_line_endings(&text);
        if text.trim().is_empty() {
            return Err(LoaderError::EmptyDocument);
        }
        Ok(text)
    }
}

/// Flatten an HTML document to text, skipping script and style content.
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    collect_text(document.root_element(), &mut out);
    out
}

fn collect_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            if matches!(
                child_element.value().name(),
                "script" | "style" | "noscript"
            ) {
                continue;
            }
            collect_text(child_element, out);
        } else if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(trimmed);
            }
        }
    }
}
