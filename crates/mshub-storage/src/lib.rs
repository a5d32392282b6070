//! Raw page archive, HTTP fetch utilities, paginated fetch-with-retry and the
//! snapshot store for mshub.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mshub_core::FailurePolicy;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod store;

pub use store::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore, StoreError};

pub const CRATE_NAME: &str = "mshub-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw vendor page bodies.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        period_key: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_id)
            .join(period_key)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store one page body immutably using a hash-addressed path and an atomic temp-file rename.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        period_key: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(
            fetched_at,
            source_id,
            period_key,
            &content_hash,
            extension,
        );
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("artifact path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    /// HTTP 429; retried with exponential backoff.
    RateLimited,
    /// 5xx, timeouts, connect failures; retried with a fixed delay.
    Transient,
    Permanent,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Transient
    } else {
        RetryDisposition::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Transient
    } else {
        RetryDisposition::Permanent
    }
}

/// Retry schedule for one page request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub rate_limit_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub transient_retries: u32,
    pub transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_retries: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
            transient_retries: 2,
            transient_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Same retry counts as the default, without any sleeping.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            transient_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn rate_limit_delay(&self, attempt_index: u32) -> Duration {
        let factor = self.multiplier.max(1).checked_pow(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("fetcher is shut down")]
    Shutdown,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Permanent),
            FetchError::Malformed { .. } | FetchError::Shutdown => RetryDisposition::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Single-attempt HTTP client with global/per-source concurrency limits.
///
/// Retrying is the paginator's job; see [`fetch_all_pages`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_once(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Shutdown)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.send_once(url).instrument(span).await
    }

    async fn send_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json, text/html;q=0.8")
            .send()
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            debug!(status = status.as_u16(), "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                retry_after,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse { final_url, body })
    }
}

/// One page as returned by a [`PageSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// The vendor explicitly signalled there is nothing after this page.
    pub end_of_data: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            end_of_data: false,
        }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            end_of_data: true,
        }
    }
}

/// Transport seam for the paginator. Must be stateless: fetching the same
/// page index twice issues the same request.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    async fn fetch_page(&self, page_index: u32) -> Result<Page<Self::Item>, FetchError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PagePlan {
    pub page_size: u32,
    /// Safety bound; the loop never requests more pages than this.
    pub max_pages: u32,
    pub page_delay: Duration,
    pub on_rate_limit_exhausted: FailurePolicy,
}

impl Default for PagePlan {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 50,
            page_delay: Duration::from_millis(500),
            on_rate_limit_exhausted: FailurePolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ShortPage,
    VendorEnd,
    MaxPages,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Complete,
    Partial,
    NoData,
}

/// Why a page could not be fetched after all retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub page_index: u32,
    pub disposition: RetryDisposition,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub pages_fetched: u32,
    pub failed_pages: u32,
    pub stop: StopReason,
    pub failure: Option<FetchFailure>,
}

impl<T> Paged<T> {
    pub fn status(&self) -> FetchStatus {
        if self.items.is_empty() {
            FetchStatus::NoData
        } else if self.failure.is_some() {
            FetchStatus::Partial
        } else {
            FetchStatus::Complete
        }
    }
}

/// Fetch pages from `source` until a short page, a vendor end signal, an
/// aborting failure, or `plan.max_pages`.
pub async fn fetch_all_pages<S>(source: &S, plan: &PagePlan, retry: &RetryPolicy) -> Paged<S::Item>
where
    S: PageSource + ?Sized,
{
    let mut items = Vec::new();
    let mut pages_fetched = 0u32;
    let mut failed_pages = 0u32;
    let mut failure = None;
    let mut stop = StopReason::MaxPages;

    for page_index in 0..plan.max_pages.max(1) {
        if page_index > 0 && !plan.page_delay.is_zero() {
            tokio::time::sleep(plan.page_delay).await;
        }

        match fetch_page_with_retry(source, page_index, retry).await {
            Ok(page) => {
                pages_fetched += 1;
                let count = page.items.len();
                items.extend(page.items);
                if page.end_of_data {
                    stop = StopReason::VendorEnd;
                    break;
                }
                if count < plan.page_size as usize {
                    stop = StopReason::ShortPage;
                    break;
                }
            }
            Err(page_failure) => {
                failed_pages += 1;
                if page_failure.disposition == RetryDisposition::RateLimited
                    && plan.on_rate_limit_exhausted == FailurePolicy::SkipPage
                {
                    warn!(
                        page_index,
                        attempts = page_failure.attempts,
                        "skipping rate-limited page"
                    );
                    continue;
                }
                warn!(
                    page_index,
                    attempts = page_failure.attempts,
                    error = %page_failure.message,
                    "aborting paginated fetch"
                );
                failure = Some(page_failure);
                stop = StopReason::Aborted;
                break;
            }
        }
    }

    Paged {
        items,
        pages_fetched,
        failed_pages,
        stop,
        failure,
    }
}

async fn fetch_page_with_retry<S>(
    source: &S,
    page_index: u32,
    retry: &RetryPolicy,
) -> Result<Page<S::Item>, FetchFailure>
where
    S: PageSource + ?Sized,
{
    let mut rate_limited = 0u32;
    let mut transient = 0u32;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match source.fetch_page(page_index).await {
            Ok(page) => return Ok(page),
            Err(err) => err,
        };

        let disposition = err.disposition();
        let delay = match disposition {
            RetryDisposition::RateLimited if rate_limited < retry.rate_limit_retries => {
                let backoff = retry.rate_limit_delay(rate_limited);
                rate_limited += 1;
                Some(
                    err.retry_after()
                        .map_or(backoff, |hint| hint.max(backoff).min(retry.max_delay)),
                )
            }
            RetryDisposition::Transient if transient < retry.transient_retries => {
                transient += 1;
                Some(retry.transient_delay)
            }
            _ => None,
        };

        match delay {
            Some(delay) => {
                debug!(page_index, attempts, ?disposition, ?delay, error = %err, "retrying page");
                tokio::time::sleep(delay).await;
            }
            None => {
                return Err(FetchFailure {
                    page_index,
                    disposition,
                    attempts,
                    message: err.to_string(),
                })
            }
        }
    }
}
