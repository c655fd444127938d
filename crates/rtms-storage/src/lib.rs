//! Durable progress files, store backups, and rate-aware HTTP fetch utilities for RTMS.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod backup;
pub mod checkpoint;

pub use backup::{BackupObject, BackupStore, BackupTransfer, DirectoryBackupStore};
pub use checkpoint::{Checkpoint, CheckpointFile, CheckpointState, CheckpointStats, FailedEntry};

pub const CRATE_NAME: &str = "rtms-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes next to `dest` under a unique temp name, then rename over it.
pub async fn write_atomically(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, dest).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("atomically renaming {} -> {}", temp_path.display(), dest.display())
        });
    }
    Ok(())
}

/// Stream `src` into a temp file beside `dest` and rename it into place.
/// Returns the byte count and SHA-256 of what was copied.
pub async fn copy_atomically(src: &Path, dest: &Path) -> anyhow::Result<(u64, String)> {
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let mut reader = fs::File::open(src)
        .await
        .with_context(|| format!("opening {}", src.display()))?;
    let temp_path = parent.join(format!(".{}.copy.tmp", Uuid::new_v4()));
    let mut writer = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;

    let copied = async {
        let mut hasher = Sha256::new();
        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        writer.sync_all().await?;
        Ok::<_, std::io::Error>((total, hex::encode(hasher.finalize())))
    }
    .await;
    drop(writer);

    let (total, digest) = match copied {
        Ok(done) => done,
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("copying {} -> {}", src.display(), temp_path.display()));
        }
    };

    if let Err(err) = fs::rename(&temp_path, dest).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("atomically renaming {} -> {}", temp_path.display(), dest.display())
        });
    }
    Ok((total, digest))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only rate limiting and gateway overload are worth waiting out upstream.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::BAD_GATEWAY {
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

/// `wait = min(base_delay * growth^attempt + uniform(0, jitter), max_delay)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub growth: f64,
    pub jitter: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            growth: 2.0,
            jitter: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.delay_with_jitter(attempt_index, 0.0)
    }

    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt_index: usize, rng: &mut R) -> Duration {
        self.delay_with_jitter(attempt_index, rng.gen_range(0.0..=1.0))
    }

    fn delay_with_jitter(&self, attempt_index: usize, unit: f64) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.growth.powi(exponent);
        let secs = scaled + self.jitter.as_secs_f64() * unit;
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Paid after every attempt, successful or not.
    pub request_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 5,
            backoff: BackoffPolicy::default(),
            request_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    request_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

/// Terminal fetch outcomes. `Display` is the cause recorded in the checkpoint.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("Max retries ({attempts}) exceeded")]
    RetriesExhausted { attempts: usize, last_cause: String },
    /// Carries the error without its URL, which holds the service key.
    #[error("{0}")]
    Request(reqwest::Error),
    #[error("fetcher closed")]
    Closed,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.without_url())
    }
}

impl FetchError {
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

enum Attempt {
    Done(FetchedResponse),
    Retry(String),
    Terminal(FetchError),
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
            backoff: config.backoff,
            request_delay: config.request_delay,
        })
    }

    /// GET `url` with bounded retries. Retryable outcomes (timeouts, connect
    /// failures, connections dropped before a response, 429, 502) back off and
    /// try again; anything else ends the call.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_cause = String::new();

        for attempt in 0..max_attempts {
            let outcome = self.attempt(url, query, attempt + 1).await;
            self.pace().await;

            match outcome {
                Attempt::Done(response) => return Ok(response),
                Attempt::Terminal(err) => return Err(err),
                Attempt::Retry(cause) => {
                    if attempt + 1 < max_attempts {
                        let wait = self.backoff.jittered_delay(attempt, &mut rand::thread_rng());
                        warn!(
                            cause = %cause,
                            attempt = attempt + 1,
                            max_attempts,
                            wait_secs = wait.as_secs_f64(),
                            "retryable fetch failure, backing off"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    last_cause = cause;
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts: max_attempts,
            last_cause,
        })
    }

    async fn attempt(&self, url: &str, query: &[(&str, String)], attempt_no: usize) -> Attempt {
        let resp = match self.client.get(url).query(query).send().await {
            Ok(resp) => resp,
            Err(err) => {
                return match classify_reqwest_error(&err) {
                    RetryDisposition::Retryable => Attempt::Retry(describe_transport_error(&err)),
                    RetryDisposition::NonRetryable => Attempt::Terminal(FetchError::from(err)),
                }
            }
        };

        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            return match resp.bytes().await {
                Ok(body) => {
                    debug!(%status, bytes = body.len(), attempt_no, "fetched");
                    Attempt::Done(FetchedResponse {
                        status,
                        final_url,
                        body: body.to_vec(),
                        attempts: attempt_no,
                    })
                }
                Err(err) => match classify_reqwest_error(&err) {
                    RetryDisposition::Retryable => Attempt::Retry(describe_transport_error(&err)),
                    RetryDisposition::NonRetryable => Attempt::Terminal(FetchError::from(err)),
                },
            };
        }

        match classify_status(status) {
            RetryDisposition::Retryable => Attempt::Retry(format!("HTTP {}", status.as_u16())),
            RetryDisposition::NonRetryable => Attempt::Terminal(FetchError::HttpStatus {
                status: status.as_u16(),
            }),
        }
    }

    async fn pace(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timeout".to_string()
    } else if err.is_connect() {
        "connection error".to_string()
    } else {
        // The top-level message names the URL; only the cause is kept.
        match std::error::Error::source(err) {
            Some(source) => format!("request error: {source}"),
            None => "request error".to_string(),
        }
    }
}
