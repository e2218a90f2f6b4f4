//! Feed Fetcher
//!
//! Retrieves feed documents over HTTP with a bounded timeout and exponential
//! backoff on transient failures. Each fetch is independent; one slow or
//! broken source never delays another.

use crate::config::{FeedSource, PipelineConfig};
use crate::feed::FeedParser;
use crate::RawDocument;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("threatflow/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml, text/xml";
const BACKOFF_JITTER_MS: u64 = 250;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {0}")]
    Http(u16),
    #[error("malformed feed: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Transient failures are retried with backoff; permanent ones (4xx,
    /// malformed feeds) are reported immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Http(code) => *code >= 500,
            FetchError::Malformed(_) => false,
        }
    }
}

/// Fetch seam the scheduler drives; lets tests substitute the network.
#[async_trait]
pub trait FetchFeed: Send + Sync {
    async fn fetch(&self, source: &FeedSource) -> Result<Vec<RawDocument>, FetchError>;
}

pub struct FeedFetcher {
    client: reqwest::Client,
    parser: FeedParser,
    max_retries: u32,
    backoff_base: Duration,
}

impl FeedFetcher {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.fetch_timeout_secs))
                .user_agent(USER_AGENT)
                .build()
                .expect("failed to build HTTP client"),
            parser: FeedParser::new(),
            max_retries: config.max_fetch_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    async fn fetch_once(&self, source: &FeedSource) -> Result<Vec<RawDocument>, FetchError> {
        debug!(source = %source.name, url = %source.url, "fetching feed");

        let response = self
            .client
            .get(&source.url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let items = self
            .parser
            .parse(&body)
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        let fetched_at = chrono::Utc::now();
        let documents = items
            .into_iter()
            .map(|item| {
                let title = self.parser.clean_html(&item.title);
                let text = self.parser.clean_html(item.body());
                RawDocument {
                    fingerprint: content_fingerprint(&title, &text),
                    source: source.name.clone(),
                    title,
                    link: item.link,
                    body: text,
                    published: item.published,
                    fetched_at,
                }
            })
            .collect::<Vec<_>>();

        info!(
            source = %source.name,
            documents = documents.len(),
            "feed fetched"
        );
        Ok(documents)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
        exp + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl FetchFeed for FeedFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<Vec<RawDocument>, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(source).await {
                Ok(documents) => return Ok(documents),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    attempt += 1;
                    warn!(
                        source = %source.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Stable content fingerprint: SHA-256 over the normalized (lowercased,
/// whitespace-trimmed) title and body. The deduplication key for a record.
pub fn content_fingerprint(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(body.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_under_case_and_padding() {
        let a = content_fingerprint("Title", "Body text");
        let b = content_fingerprint("  title  ", "body text  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_differs_for_different_content() {
        let a = content_fingerprint("Title", "Body one");
        let b = content_fingerprint("Title", "Body two");
        assert_ne!(a, b);
    }

    #[test]
    fn transient_and_permanent_failures_classified() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(FetchError::Http(503).is_transient());
        assert!(!FetchError::Http(404).is_transient());
        assert!(!FetchError::Malformed("bad xml".into()).is_transient());
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let fetcher = FeedFetcher::new(&PipelineConfig::default());
        let first = fetcher.backoff_delay(0);
        let third = fetcher.backoff_delay(2);
        // Jitter is at most 250ms; the exponential component dominates.
        assert!(third >= first);
        assert!(fetcher.backoff_delay(0) >= Duration::from_millis(500));
        assert!(fetcher.backoff_delay(2) >= Duration::from_millis(2000));
    }
}
