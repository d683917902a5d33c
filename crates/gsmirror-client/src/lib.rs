//! HTTP access to the registry catalog and the SustainCert document API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use gsmirror_core::RawRecord;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::info_span;

pub const CRATE_NAME: &str = "gsmirror-client";

pub const DEFAULT_CATALOG_URL: &str = "https://public-api.goldstandard.org/projects";
pub const DEFAULT_DOCUMENT_LIST_URL: &str =
    "https://sc-platform-certification-prod.azurewebsites.net/api/document/publiclist";
pub const DEFAULT_DOCUMENT_DOWNLOAD_URL: &str =
    "https://sc-platform-certification-prod.azurewebsites.net/api/document/publicdownload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Transport-layer identity presented to the upstream services. Kept apart
/// from pipeline logic so deployments can swap header sets freely.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    pub user_agent: String,
    pub origin: Option<String>,
    pub referer: Option<String>,
}

impl Default for RequestProfile {
    fn default() -> Self {
        Self {
            user_agent: "gsmirror-bot/0.1".to_string(),
            origin: None,
            referer: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub catalog_url: String,
    pub document_list_url: String,
    pub document_download_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            document_list_url: DEFAULT_DOCUMENT_LIST_URL.to_string(),
            document_download_url: DEFAULT_DOCUMENT_DOWNLOAD_URL.to_string(),
        }
    }
}

/// Query parameters injected into every catalog page request, except the page
/// number itself which the crawl loop supplies.
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub query: String,
    pub size: u32,
    pub sort_column: String,
    pub sort_direction: String,
}

impl Default for CatalogQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            size: 25,
            sort_column: String::new(),
            sort_direction: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub profile: RequestProfile,
    pub endpoints: EndpointConfig,
    pub catalog_query: CatalogQuery,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            profile: RequestProfile::default(),
            endpoints: EndpointConfig::default(),
            catalog_query: CatalogQuery::default(),
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Seam between the pipeline and the two upstream services. Production uses
/// [`HttpRegistryClient`]; tests substitute in-memory fakes.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// One page of catalog records. A non-success status or a body that is
    /// not a JSON array is a failure for this page only.
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, FetchError>;

    /// Public file names available for the given project. Zero files is a
    /// valid response, not an error.
    async fn list_documents(&self, project_id: &str) -> Result<Vec<String>, FetchError>;

    /// Raw bytes of one public document.
    async fn fetch_document(&self, project_id: &str, file_name: &str)
        -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct DocumentListResponse {
    #[serde(default)]
    files: Vec<DocumentEntry>,
}

#[derive(Debug, Deserialize)]
struct DocumentEntry {
    #[serde(rename = "fileName")]
    file_name: String,
}

#[derive(Debug)]
pub struct HttpRegistryClient {
    client: reqwest::Client,
    endpoints: EndpointConfig,
    catalog_query: CatalogQuery,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpRegistryClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.profile.user_agent.clone());

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(origin) = &config.profile.origin {
            headers.insert(reqwest::header::ORIGIN, origin.parse().context("origin header")?);
        }
        if let Some(referer) = &config.profile.referer {
            headers.insert(
                reqwest::header::REFERER,
                referer.parse().context("referer header")?,
            );
        }
        if !headers.is_empty() {
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoints: config.endpoints,
            catalog_query: config.catalog_query,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn get_bytes(&self, url: &str, params: &[(&str, String)]) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("registry_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).query(params).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, FetchError> {
        let params = [
            ("query", self.catalog_query.query.clone()),
            ("size", self.catalog_query.size.to_string()),
            ("sortColumn", self.catalog_query.sort_column.clone()),
            ("sortDirection", self.catalog_query.sort_direction.clone()),
            ("page", page.to_string()),
        ];
        let body = self.get_bytes(&self.endpoints.catalog_url, &params).await?;
        let decoded: Vec<JsonValue> =
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: self.endpoints.catalog_url.clone(),
                source,
            })?;
        decoded
            .into_iter()
            .map(|value| match value {
                JsonValue::Object(map) => Ok(map),
                other => Err(FetchError::Decode {
                    url: self.endpoints.catalog_url.clone(),
                    source: serde::de::Error::custom(format!(
                        "expected object in catalog array, got {other}"
                    )),
                }),
            })
            .collect()
    }

    async fn list_documents(&self, project_id: &str) -> Result<Vec<String>, FetchError> {
        let params = [("projectID", project_id.to_string())];
        let body = self
            .get_bytes(&self.endpoints.document_list_url, &params)
            .await?;
        let decoded: DocumentListResponse =
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: self.endpoints.document_list_url.clone(),
                source,
            })?;
        Ok(decoded.files.into_iter().map(|f| f.file_name).collect())
    }

    async fn fetch_document(
        &self,
        project_id: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let params = [
            ("projectID", project_id.to_string()),
            ("fileName", file_name.to_string()),
        ];
        self.get_bytes(&self.endpoints.document_download_url, &params)
            .await
    }
}
