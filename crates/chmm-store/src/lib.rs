//! Durable namespaced cache + polite HTTP fetch utilities for CHMM.
//!
//! The cache store is the only structure the pipeline touches from multiple
//! workers at once. Writes go through a temp-file-and-rename so a reader can
//! never observe a partial entry; last writer wins, which is acceptable since
//! content at a given key is expected to be stable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chmm-store";

/// Cache namespaces. Keys are scoped per namespace; one key never collides
/// across namespaces because each namespace is its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Namespace {
    DetailPage,
    DocumentText,
    Geocode,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::DetailPage => "detail-page",
            Namespace::DocumentText => "document-text",
            Namespace::Geocode => "geocode",
        }
    }

    pub const ALL: [Namespace; 3] = [
        Namespace::DetailPage,
        Namespace::DocumentText,
        Namespace::Geocode,
    ];
}

/// One persisted cache record. The original key is stored alongside the
/// payload so entries stay auditable even though filenames are key hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub written_at: DateTime<Utc>,
}

/// On-disk key/value store surviving process restarts. No eviction: growth
/// is bounded only by operator-initiated `clear` calls.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
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

    /// Keys may be arbitrary URLs or address strings, so the filename is the
    /// key's hash rather than the key itself.
    fn entry_path(&self, namespace: Namespace, key: &str) -> PathBuf {
        self.root
            .join(namespace.as_str())
            .join(format!("{}.json", Self::sha256_hex(key.as_bytes())))
    }

    /// Look up `key` in `namespace`. A corrupt entry reads as a miss so a
    /// partially-written file from a crashed run self-heals on rewrite.
    pub async fn get(&self, namespace: Namespace, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(namespace, key);
        let data = fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<CacheEntry>(&data) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(namespace = namespace.as_str(), %err, "discarding corrupt cache entry");
                None
            }
        }
    }

    /// Write `value` under (`namespace`, `key`) via atomic temp-file rename.
    pub async fn put(&self, namespace: Namespace, key: &str, value: &str) -> anyhow::Result<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.to_string(),
            written_at: Utc::now(),
        };
        let path = self.entry_path(namespace, key);
        let parent = path.parent().expect("cache path always has parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let payload = serde_json::to_vec(&entry).context("serializing cache entry")?;

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(&payload)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming cache entry {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }

    /// Operator-initiated clear of one namespace. Clearing a namespace that
    /// was never written is not an error.
    pub async fn clear(&self, namespace: Namespace) -> anyhow::Result<()> {
        let dir = self.root.join(namespace.as_str());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("clearing cache namespace {}", dir.display()))
            }
        }
    }
}

/// Cooperative stop signal. Stages check it before issuing new fetches;
/// in-flight cache writes always run to completion.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
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

/// Shared minimum-interval gate. Every worker awaiting `wait_turn` is spaced
/// at least `min_interval` after the previous departure, across the whole
/// pool, not per worker.
#[derive(Debug)]
pub struct IntervalGate {
    min_interval: Duration,
    last_departure: Mutex<Option<Instant>>,
}

impl IntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_departure: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        // Holding the lock across the sleep is what serializes departures.
        let mut last = self.last_departure.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub worker_limit: usize,
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: "chmm/0.1 (research)".to_string(),
            worker_limit: 4,
            min_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Outbound HTTP with a bounded worker pool, one shared politeness gate,
/// and bounded exponential retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    worker_limit: Arc<Semaphore>,
    gate: IntervalGate,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            worker_limit: Arc::new(Semaphore::new(config.worker_limit.max(1))),
            gate: IntervalGate::new(config.min_interval),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .worker_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            self.gate.wait_turn().await;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
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
