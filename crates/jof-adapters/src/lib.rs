//! Offer source contracts + HTTP, file and in-memory implementations.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use jof_core::JobOfferRecord;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "jof-adapters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed offer payload from {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading offer file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// External provider of job offers.
///
/// `fetch` returns the whole current batch in provider order. Implementations
/// own any transport retries; callers treat an `Err` as a failed fetch.
#[async_trait]
pub trait OfferSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<JobOfferRecord>, FetchError>;
}

pub fn decode_offer_records(origin: &str, bytes: &[u8]) -> Result<Vec<JobOfferRecord>, FetchError> {
    serde_json::from_slice(bytes).map_err(|source| FetchError::Decode {
        origin: origin.to_string(),
        source,
    })
}

/// How many times a provider fetch is repeated after a transient failure, and
/// how long to wait before each repeat.
///
/// The wait doubles after every retry starting from `first_delay` and never
/// exceeds `delay_cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub first_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            first_delay: Duration::from_millis(500),
            delay_cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (zero-based).
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let mut delay = self.first_delay;
        for _ in 0..retry {
            if delay >= self.delay_cap {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.delay_cap)
    }

    /// Provider overload or outage. A 4xx other than 429 means the request
    /// itself is wrong and repeating it cannot help.
    pub fn retries_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn retries_transport_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl HttpSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a single GET against the provider.
enum Attempt {
    Done(Result<Vec<JobOfferRecord>, FetchError>),
    Transient(FetchError),
}

/// Pulls offers from a provider endpoint that answers `GET` with a JSON array.
#[derive(Debug)]
pub struct HttpOfferSource {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpOfferSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(|source| FetchError::Request {
            url: config.url.clone(),
            source,
        })?;

        Ok(Self {
            client,
            url: config.url,
            retry: config.retry,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn attempt(&self) -> Attempt {
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(source) => {
                let transient = RetryPolicy::retries_transport_error(&source);
                let err = FetchError::Request {
                    url: self.url.clone(),
                    source,
                };
                return if transient {
                    Attempt::Transient(err)
                } else {
                    Attempt::Done(Err(err))
                };
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            };
            return if RetryPolicy::retries_status(status) {
                Attempt::Transient(err)
            } else {
                Attempt::Done(Err(err))
            };
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: self.url.clone(),
            source,
        });
        Attempt::Done(body.and_then(|bytes| decode_offer_records(&self.url, &bytes)))
    }

    async fn fetch_with_retries(&self) -> Result<Vec<JobOfferRecord>, FetchError> {
        let mut retry = 0;
        loop {
            match self.attempt().await {
                Attempt::Done(result) => return result,
                Attempt::Transient(err) if retry < self.retry.max_retries => {
                    let delay = self.retry.delay_before_retry(retry);
                    warn!(error = %err, retry, delay_ms = delay.as_millis() as u64, "provider fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Attempt::Transient(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl OfferSource for HttpOfferSource {
    fn source_id(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<JobOfferRecord>, FetchError> {
        let span = info_span!("offer_fetch", source = "http", url = %self.url);
        let records = self.fetch_with_retries().instrument(span).await?;
        debug!(count = records.len(), url = %self.url, "fetched offer records");
        Ok(records)
    }
}

/// Reads a JSON array of offer records from disk on every fetch.
#[derive(Debug, Clone)]
pub struct FileOfferSource {
    path: PathBuf,
    source_id: String,
}

impl FileOfferSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let source_id = path.display().to_string();
        Self { path, source_id }
    }
}

#[async_trait]
impl OfferSource for FileOfferSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Vec<JobOfferRecord>, FetchError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.source_id.clone(),
                source,
            })?;
        decode_offer_records(&self.source_id, &bytes)
    }
}

/// In-memory source whose batch can be swapped between fetches.
#[derive(Debug, Default)]
pub struct StaticOfferSource {
    records: RwLock<Vec<JobOfferRecord>>,
}

impl StaticOfferSource {
    pub fn new(records: Vec<JobOfferRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn replace(&self, records: Vec<JobOfferRecord>) {
        *self.records.write().await = records;
    }
}

#[async_trait]
impl OfferSource for StaticOfferSource {
    fn source_id(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Vec<JobOfferRecord>, FetchError> {
        Ok(self.records.read().await.clone())
    }
}
