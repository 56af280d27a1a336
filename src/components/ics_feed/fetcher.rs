use super::models::{CalendarSource, Document};
use super::parser::parse_document;
use super::sanitize::sanitize;
use crate::components::cache_service::CacheHandle;
use crate::error::{fetch_error, FeedResult};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default `User-Agent` sent with feed requests
pub const DEFAULT_USER_AGENT: &str = concat!("calfeed/", env!("CARGO_PKG_VERSION"));

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retrieves raw calendar text for a URL
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn fetch_text(&self, url: &str) -> FeedResult<String>;
}

/// HTTP transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| fetch_error(None, &format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn fetch_text(&self, url: &str) -> FeedResult<String> {
        let url = request_url(url)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.status().map(|s| s.as_u16()), &e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(fetch_error(Some(status.as_u16()), &format!("HTTP {}", status)));
        }

        response
            .text()
            .await
            .map_err(|e| fetch_error(None, &format!("Failed to read response body: {}", e)))
    }
}

/// Parse a feed URL, mapping `webcal://` onto `https://`
pub fn request_url(raw: &str) -> FeedResult<Url> {
    let trimmed = raw.trim();
    let normalized = match trimmed.get(..9) {
        Some(scheme) if scheme.eq_ignore_ascii_case("webcal://") => {
            format!("https://{}", &trimmed[9..])
        }
        _ => trimmed.to_string(),
    };

    Url::parse(&normalized).map_err(|e| fetch_error(None, &format!("Invalid URL {}: {}", raw, e)))
}

/// Resolves sources to parsed documents, going through the cache
#[derive(Clone)]
pub struct SourceFetcher {
    transport: Arc<dyn FeedTransport>,
    cache: CacheHandle,
}

impl SourceFetcher {
    pub fn new(transport: Arc<dyn FeedTransport>, cache: CacheHandle) -> Self {
        Self { transport, cache }
    }

    /// Cached document for `source`, or a fresh fetch, sanitize and parse.
    ///
    /// The cache is only written after the whole pipeline succeeded. A cache
    /// that cannot be read or written degrades to a plain fetch.
    pub async fn resolve(&self, source: &CalendarSource) -> FeedResult<Document> {
        match self.cache.get(&source.url).await {
            Ok(Some(document)) => {
                debug!(source = %source.name, "Using cached calendar");
                return Ok(document);
            }
            Ok(None) => {}
            Err(e) => warn!(source = %source.name, error = %e, "Calendar cache unavailable"),
        }

        info!(source = %source.name, "Fetching calendar");
        let text = self.transport.fetch_text(&source.url).await?;
        let document = parse_document(&sanitize(&text))?;
        debug!(source = %source.name, components = document.len(), "Parsed calendar");

        if let Err(e) = self.cache.put(&source.url, document.clone()).await {
            warn!(source = %source.name, error = %e, "Failed to cache calendar");
        }
        Ok(document)
    }

    /// Forget the cached document for `source`
    pub async fn invalidate(&self, source: &CalendarSource) -> FeedResult<()> {
        self.cache.invalidate(&source.url).await
    }
}
