//! Lead-store persistence, raw search-response captures, and HTTP fetch
//! utilities for jobhound.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobhound_core::Lead;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobhound-storage";

/// Result of loading the persisted lead store.
///
/// A missing or unparseable file is an empty store, never an error. Array
/// elements that fail to deserialize (typically a mangled `found_at`) are
/// dropped individually and counted, equivalent to an early retention purge.
#[derive(Debug, Clone, Default)]
pub struct StoreLoadReport {
    pub leads: Vec<Lead>,
    pub dropped_records: usize,
}

/// The single JSON document holding the ordered lead sequence.
#[derive(Debug, Clone)]
pub struct LeadStore {
    path: PathBuf,
}

impl LeadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> StoreLoadReport {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return StoreLoadReport::default();
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "lead store unreadable; starting empty");
                return StoreLoadReport::default();
            }
        };

        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "lead store corrupt; starting empty");
                return StoreLoadReport::default();
            }
        };

        let mut report = StoreLoadReport {
            leads: Vec::with_capacity(values.len()),
            dropped_records: 0,
        };
        for value in values {
            match serde_json::from_value::<Lead>(value) {
                Ok(lead) => report.leads.push(lead),
                Err(err) => {
                    report.dropped_records += 1;
                    warn!(%err, "dropping malformed lead record");
                }
            }
        }
        report
    }

    /// Replaces the store with the full sequence via a same-directory temp
    /// file and atomic rename, so readers never observe a torn document.
    /// This is the one storage operation whose failure must reach the caller.
    pub async fn save(&self, leads: &[Lead]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(leads).context("serializing lead store")?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating store directory {}", dir.display()))?;

        let temp_path = dir.join(format!(".{}.leads.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically replacing lead store {} via {}",
                    self.path.display(),
                    temp_path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredCapture {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of raw search-API response bodies, addressed by
/// content hash under a per-day, per-query directory.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    root: PathBuf,
}

impl CaptureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn capture_relative_path(
        fetched_at: DateTime<Utc>,
        query_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        PathBuf::from(day)
            .join(query_id)
            .join(format!("{content_hash}.json"))
    }

    /// Stores one response body immutably; an identical body captured the
    /// same day for the same query resolves to the existing file.
    pub async fn store_response(
        &self,
        fetched_at: DateTime<Utc>,
        query_id: &str,
        body: &[u8],
    ) -> anyhow::Result<StoredCapture> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = Self::capture_relative_path(fetched_at, query_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .expect("capture path always has a parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating capture directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking capture path {}", absolute_path.display()))?
        {
            return Ok(StoredCapture {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: body.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp capture file {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp capture file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp capture file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredCapture {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: body.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredCapture {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: body.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp capture {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

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

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Coarse token bucket shared by all query fetches in a run. Search APIs
/// meter by request, not bytes, so one token per POST is enough.
#[derive(Debug)]
pub struct QueryTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl QueryTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub api_key: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for SearchClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_key: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper for JSON search-API calls: API-key header, bounded
/// concurrency, optional rate limiting, and retry with exponential backoff.
#[derive(Debug)]
pub struct SearchHttpClient {
    client: reqwest::Client,
    api_key: Option<String>,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<QueryTokenBucket>>,
    backoff: BackoffPolicy,
}

impl SearchHttpClient {
    pub fn new(config: SearchClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let token_bucket = config
            .rate_limit
            .map(|c| Arc::new(QueryTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            api_key: config.api_key,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// POSTs a JSON payload and returns the raw response body. Retries on
    /// 5xx/429 and on connect/timeout errors per `BackoffPolicy`.
    pub async fn post_json(
        &self,
        run_id: Uuid,
        query_id: &str,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<SearchResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("search_fetch", %run_id, query_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.post(url).json(payload);
            if let Some(key) = &self.api_key {
                request = request.header("X-API-KEY", key);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(SearchResponse { status, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
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
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobhound_core::{lead_id_for_url, LeadStatus};
    use tempfile::tempdir;

    fn mk_lead(url: &str, found_at: DateTime<Utc>) -> Lead {
        Lead {
            id: lead_id_for_url(url),
            url: url.to_string(),
            title: "Data Analyst at Acme Corp".to_string(),
            company: "Acme Corp".to_string(),
            status: LeadStatus::New,
            found_at,
            posted_at: Some("2 days ago".to_string()),
            score: Some(80),
        }
    }

    #[test]
    fn capture_hashing_is_stable() {
        let hash = CaptureStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn captures_deduplicate_by_content_hash() {
        let dir = tempdir().expect("tempdir");
        let store = CaptureStore::new(dir.path());
        let fetched_at = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).single().unwrap();

        let first = store
            .store_response(fetched_at, "greenhouse-data-analyst", b"{\"organic\":[]}")
            .await
            .expect("first capture");
        let second = store
            .store_response(fetched_at, "greenhouse-data-analyst", b"{\"organic\":[]}")
            .await
            .expect("second capture");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn lead_store_round_trips_unchanged() {
        let dir = tempdir().expect("tempdir");
        let store = LeadStore::new(dir.path().join("jobs.json"));
        let found_at = Utc.with_ymd_and_hms(2026, 8, 5, 9, 30, 0).single().unwrap();
        let leads = vec![
            mk_lead("https://boards.greenhouse.io/acme/jobs/1", found_at),
            mk_lead("https://jobs.lever.co/acme/2", found_at),
        ];

        store.save(&leads).await.expect("save");
        let report = store.load().await;

        assert_eq!(report.leads, leads);
        assert_eq!(report.dropped_records, 0);
    }

    #[tokio::test]
    async fn absent_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = LeadStore::new(dir.path().join("missing.json"));
        let report = store.load().await;
        assert!(report.leads.is_empty());
        assert_eq!(report.dropped_records, 0);
    }

    #[tokio::test]
    async fn corrupt_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        fs::write(&path, b"{not json at all").await.unwrap();

        let report = LeadStore::new(&path).load().await;
        assert!(report.leads.is_empty());
    }

    #[tokio::test]
    async fn malformed_records_drop_individually() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        let found_at = Utc.with_ymd_and_hms(2026, 8, 5, 9, 30, 0).single().unwrap();
        let good = mk_lead("https://jobs.lever.co/acme/3", found_at);
        let doc = format!(
            "[{},{{\"url\":\"https://x\",\"found_at\":\"not-a-date\"}}]",
            serde_json::to_string(&good).unwrap()
        );
        fs::write(&path, doc).await.unwrap();

        let report = LeadStore::new(&path).load().await;
        assert_eq!(report.leads, vec![good]);
        assert_eq!(report.dropped_records, 1);
    }

    #[tokio::test]
    async fn token_bucket_blocks_once_drained() {
        let bucket = QueryTokenBucket::new(2, Duration::from_millis(10));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
