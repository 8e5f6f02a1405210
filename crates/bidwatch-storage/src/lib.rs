//! Atomic artifact storage + HTTP fetch utilities for bidwatch.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-storage";

#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    pub file_name: String,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Directory of JSON run artifacts (checkpoints, datasets, manifests).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
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

    /// Serialize `value` as pretty JSON and write it under `file_name`.
    pub async fn write_json_pretty<T: Serialize + ?Sized>(
        &self,
        file_name: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing artifact {file_name}"))?;
        self.write_bytes(file_name, &bytes).await
    }

    /// Replace `file_name` atomically via a temp file + rename.
    pub async fn write_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;

        let path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

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

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredArtifact {
            file_name: file_name.to_string(),
            path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 400 and 404 mean the request itself is wrong; everything else may clear up.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("malformed response from {url}: {reason}")]
    MalformedBody { url: String, reason: String },
    #[error("{label} failed after {attempts} attempts: {last}")]
    Exhausted {
        label: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            FetchError::Exhausted { .. } => RetryDisposition::NonRetryable,
            FetchError::Timeout { .. }
            | FetchError::Transport { .. }
            | FetchError::MalformedBody { .. } => RetryDisposition::Retryable,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::HttpStatus { .. })
            && self.disposition() == RetryDisposition::NonRetryable
    }

    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Linear backoff: the wait after failed attempt `n` (0-based) is `base_delay * (n + 1)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Pause taken before every attempt, including the first.
    pub pre_attempt_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            pre_attempt_delay: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index + 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn with_pre_attempt_delay(mut self, delay: Duration) -> Self {
        self.pre_attempt_delay = delay;
        self
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Non-retryable errors are returned as-is after a single attempt; exhausting
/// the budget wraps the last error in [`FetchError::Exhausted`].
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt_index = 0;
    loop {
        if !policy.pre_attempt_delay.is_zero() {
            tokio::time::sleep(policy.pre_attempt_delay).await;
        }

        let err = match attempt(attempt_index).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.disposition() == RetryDisposition::NonRetryable {
            warn!(label, error = %err, "permanent failure, not retrying");
            return Err(err);
        }

        if attempt_index + 1 >= max_attempts {
            return Err(FetchError::Exhausted {
                label: label.to_string(),
                attempts: max_attempts,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_for_attempt(attempt_index);
        warn!(
            label,
            attempt = attempt_index + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        attempt_index += 1;
    }
}

/// JSON-over-HTTP seam used by the portal adapters.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    /// One POST attempt; retries are the caller's business.
    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Caps both in-flight requests and pooled idle connections.
    pub max_connections: usize,
    /// Trust exception for the scraped portal's certificate chain.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_connections: 5,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let max_connections = config.max_connections.max(1);
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(max_connections)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(max_connections)),
        })
    }
}

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let span = info_span!("http_post", url);
        async {
            let resp = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;
            serde_json::from_slice::<JsonValue>(&bytes).map_err(|err| FetchError::MalformedBody {
                url: url.to_string(),
                reason: err.to_string(),
            })
        }
        .instrument(span)
        .await
    }
}
