//! Durable seen-listing storage, raw page archiving, and the shared HTTP
//! session for adwatch runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use adwatch_core::{Listing, SourceName};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-storage";

/// Stored form of a seen listing. The flattened listing keeps the on-disk
/// schema at `{title, price, url, recorded_at}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SeenRecord {
    #[serde(flatten)]
    pub listing: Listing,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SeenStoreError {
    #[error("seen-store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed seen record at {path} line {line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding seen record for {url}: {source}")]
    Encode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("seen-store unavailable for {source_name}: {reason}")]
    Unavailable { source_name: SourceName, reason: String },
}

/// Durable per-source seen-set. `record_seen` must complete before a
/// listing is reported as novel, so each append has to be independently
/// durable; the set is never pruned.
#[async_trait]
pub trait SeenStore: Send + Sync {
    async fn seen_urls(&self, source: SourceName) -> Result<HashSet<String>, SeenStoreError>;
    async fn record_seen(
        &self,
        source: SourceName,
        listing: &Listing,
    ) -> Result<(), SeenStoreError>;
}

/// Flat-file seen store: one append-only JSONL file per source under a
/// data directory. Appends are flushed and fsynced so a run interrupted
/// mid-source loses at most the record being written.
#[derive(Debug, Clone)]
pub struct JsonlSeenStore {
    root: PathBuf,
}

impl JsonlSeenStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self, source: SourceName) -> PathBuf {
        self.root.join(format!("{source}.jsonl"))
    }
}

#[async_trait]
impl SeenStore for JsonlSeenStore {
    async fn seen_urls(&self, source: SourceName) -> Result<HashSet<String>, SeenStoreError> {
        let path = self.partition_path(source);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => {
                return Err(SeenStoreError::Io {
                    path,
                    source: err,
                })
            }
        };

        let lines: Vec<&str> = text.lines().collect();
        let mut urls = HashSet::new();
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SeenRecord>(line) {
                Ok(record) => {
                    urls.insert(record.listing.url);
                }
                // A torn final line means the process died mid-append; the
                // record was never reported, so skipping it re-notifies
                // rather than drops.
                Err(err) if index + 1 == lines.len() => {
                    warn!(source = %source, line = index + 1, error = %err,
                        "skipping torn trailing seen record");
                }
                Err(err) => {
                    return Err(SeenStoreError::Malformed {
                        path,
                        line: index + 1,
                        source: err,
                    })
                }
            }
        }
        Ok(urls)
    }

    async fn record_seen(
        &self,
        source: SourceName,
        listing: &Listing,
    ) -> Result<(), SeenStoreError> {
        let record = SeenRecord {
            listing: listing.clone(),
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record).map_err(|err| SeenStoreError::Encode {
            url: listing.url.clone(),
            source: err,
        })?;
        line.push('\n');

        let path = self.partition_path(source);
        let io_err = |err| SeenStoreError::Io {
            path: path.clone(),
            source: err,
        };

        fs::create_dir_all(&self.root).await.map_err(io_err)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(())
    }
}

/// In-memory seen store for tests and dry runs, with per-source failure
/// injection to exercise the orchestrator's isolation paths.
#[derive(Debug, Default)]
pub struct MemorySeenStore {
    records: Mutex<HashMap<SourceName, Vec<SeenRecord>>>,
    fail_reads: HashSet<SourceName>,
    fail_writes: HashSet<SourceName>,
}

impl MemorySeenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_reads(mut self, sources: impl IntoIterator<Item = SourceName>) -> Self {
        self.fail_reads.extend(sources);
        self
    }

    pub fn failing_writes(mut self, sources: impl IntoIterator<Item = SourceName>) -> Self {
        self.fail_writes.extend(sources);
        self
    }

    pub async fn seed(&self, source: SourceName, urls: impl IntoIterator<Item = String>) {
        let mut records = self.records.lock().await;
        let entry = records.entry(source).or_default();
        for url in urls {
            entry.push(SeenRecord {
                listing: Listing {
                    title: String::new(),
                    price: String::new(),
                    url,
                },
                recorded_at: Utc::now(),
            });
        }
    }

    pub async fn records(&self, source: SourceName) -> Vec<SeenRecord> {
        self.records
            .lock()
            .await
            .get(&source)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SeenStore for MemorySeenStore {
    async fn seen_urls(&self, source: SourceName) -> Result<HashSet<String>, SeenStoreError> {
        if self.fail_reads.contains(&source) {
            return Err(SeenStoreError::Unavailable {
                source_name: source,
                reason: "injected read failure".to_string(),
            });
        }
        Ok(self
            .records
            .lock()
            .await
            .get(&source)
            .map(|records| records.iter().map(|r| r.listing.url.clone()).collect())
            .unwrap_or_default())
    }

    async fn record_seen(
        &self,
        source: SourceName,
        listing: &Listing,
    ) -> Result<(), SeenStoreError> {
        if self.fail_writes.contains(&source) {
            return Err(SeenStoreError::Unavailable {
                source_name: source,
                reason: "injected write failure".to_string(),
            });
        }
        self.records
            .lock()
            .await
            .entry(source)
            .or_default()
            .push(SeenRecord {
                listing: listing.clone(),
                recorded_at: Utc::now(),
            });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw fetched pages, kept for extractor
/// debugging. Writes go through a temp file and an atomic rename;
/// identical content within a stamp deduplicates by path.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
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

    pub fn page_relative_path(
        fetched_at: DateTime<Utc>,
        source: SourceName,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(source.as_str())
            .join(format!("{content_hash}.html"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source: SourceName,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_relative_path(fetched_at, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
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

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
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
}

/// One browsing session per run: a single cookie-carrying client reused
/// across every (query, source) page load, so session setup cost is paid
/// once. Never shared across concurrent runs.
#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpSession {
    pub fn new(config: SessionConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building session client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetches a page body as text, retrying transient failures with
    /// capped exponential backoff.
    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source: SourceName,
        url: &str,
    ) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", %run_id, source = source.as_str(), url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
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
    use tempfile::tempdir;

    fn listing(title: &str, url: &str) -> Listing {
        Listing {
            title: title.to_string(),
            price: "$5".to_string(),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn missing_partition_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlSeenStore::new(dir.path());
        let urls = store.seen_urls(SourceName::Ksl).await.expect("read");
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn records_become_visible_per_source() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlSeenStore::new(dir.path());

        store
            .record_seen(SourceName::Ksl, &listing("A", "https://a/1"))
            .await
            .expect("record");
        store
            .record_seen(SourceName::Ksl, &listing("B", "https://a/2"))
            .await
            .expect("record");
        store
            .record_seen(SourceName::Craigslist, &listing("C", "https://c/1"))
            .await
            .expect("record");

        let ksl = store.seen_urls(SourceName::Ksl).await.expect("read");
        assert_eq!(ksl.len(), 2);
        assert!(ksl.contains("https://a/1"));
        assert!(ksl.contains("https://a/2"));

        let craigslist = store
            .seen_urls(SourceName::Craigslist)
            .await
            .expect("read");
        assert_eq!(craigslist.len(), 1);
        assert!(!craigslist.contains("https://a/1"));
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlSeenStore::new(dir.path());
        store
            .record_seen(SourceName::Ksl, &listing("A", "https://a/1"))
            .await
            .expect("record");

        let path = dir.path().join("ksl.jsonl");
        let mut text = std::fs::read_to_string(&path).expect("read file");
        text.push_str("{\"title\":\"torn");
        std::fs::write(&path, text).expect("write file");

        let urls = store.seen_urls(SourceName::Ksl).await.expect("read");
        assert_eq!(urls.len(), 1);
    }

    #[tokio::test]
    async fn malformed_interior_line_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ksl.jsonl");
        std::fs::write(&path, "not json\n{\"also\":\"not a record\"}\n").expect("write file");

        let store = JsonlSeenStore::new(dir.path());
        let err = store.seen_urls(SourceName::Ksl).await.unwrap_err();
        assert!(matches!(err, SeenStoreError::Malformed { line: 1, .. }));
    }

    #[tokio::test]
    async fn memory_store_failure_injection() {
        let store = MemorySeenStore::new()
            .failing_reads([SourceName::Craigslist])
            .failing_writes([SourceName::FacebookMarketplace]);

        assert!(store.seen_urls(SourceName::Ksl).await.is_ok());
        assert!(store.seen_urls(SourceName::Craigslist).await.is_err());
        assert!(store
            .record_seen(SourceName::FacebookMarketplace, &listing("A", "https://f/1"))
            .await
            .is_err());
    }

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-08-23T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, SourceName::Ksl, b"<html>same</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, SourceName::Ksl, b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
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
