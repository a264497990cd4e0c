//! Durable run state (checkpoint + audit trail) and the HTTP transport shared by
//! the warehouse and CRM clients.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crmsync_core::{AuditRecord, ProcessedSet};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crmsync-storage";

pub const AUDIT_HEADER: [&str; 4] = ["matchVal", "status", "properties_json", "error"];

/// Quote a CSV field when it contains a delimiter, quote, or line break.
pub fn csv_escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// One newline-terminated CSV line.
pub fn csv_line<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = fields
        .into_iter()
        .map(|f| csv_escape(f.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    Ok(())
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    ensure_parent_dir(path).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

/// Write a complete CSV file (header plus rows), replacing any previous content.
pub async fn write_csv_file<H, R>(path: &Path, header: &[H], rows: R) -> anyhow::Result<usize>
where
    H: AsRef<str>,
    R: IntoIterator<Item = Vec<String>>,
{
    let mut out = csv_line(header);
    let mut count = 0usize;
    for row in rows {
        out.push_str(&csv_line(row));
        count += 1;
    }
    write_atomic(path, out.as_bytes()).await?;
    Ok(count)
}

/// JSON-array file of identifiers that must not be attempted again.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent, unreadable, or malformed checkpoints all load as an empty set.
    pub async fn load(&self) -> ProcessedSet {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet");
                return ProcessedSet::new();
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "checkpoint unreadable; starting empty"
                );
                return ProcessedSet::new();
            }
        };

        match serde_json::from_str::<Vec<JsonValue>>(&text) {
            Ok(values) => values
                .into_iter()
                .filter_map(|v| match v {
                    JsonValue::String(s) => Some(s),
                    JsonValue::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "checkpoint malformed; starting empty"
                );
                ProcessedSet::new()
            }
        }
    }

    pub async fn save(&self, processed: &ProcessedSet) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(processed).context("serializing checkpoint")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("saving checkpoint {}", self.path.display()))
    }
}

/// Append-only CSV trail of dispatched updates.
#[derive(Debug, Clone)]
pub struct AuditSink {
    path: PathBuf,
}

impl AuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, records: &[AuditRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        ensure_parent_dir(&self.path).await?;

        let exists = fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking audit file {}", self.path.display()))?;

        let mut out = String::new();
        if !exists {
            out.push_str(&csv_line(AUDIT_HEADER));
        }
        for record in records {
            let properties = record.properties_json();
            out.push_str(&csv_line([
                record.identifier.as_str(),
                record.status.as_str(),
                properties.as_str(),
                record.error.as_deref().unwrap_or_default(),
            ]));
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening audit file {}", self.path.display()))?;
        file.write_all(out.as_bytes())
            .await
            .with_context(|| format!("appending audit file {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing audit file {}", self.path.display()))?;
        Ok(())
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
    if err.is_timeout() || err.is_connect() {
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-provided `Retry-After` wins over the computed delay, still capped.
    pub fn delay_with_hint(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt_index))
    }
}

/// Fixed-window request budget, e.g. 100 calls per 10 seconds.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    opened_at: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(RateWindow {
                opened_at: Instant::now(),
                used: 0,
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut window = self.window.lock().await;
            let elapsed = window.opened_at.elapsed();
            if elapsed >= self.config.window {
                window.opened_at = Instant::now();
                window.used = 0;
            }
            if window.used < self.config.max_requests.max(1) {
                window.used += 1;
                return;
            }
            let wait = self.config.window.saturating_sub(elapsed);
            drop(window);
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            max_in_flight: 16,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn patch(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::PATCH, url).with_body(body)
    }

    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client is shutting down")]
    Shutdown,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// JSON-over-HTTPS client with bounded in-flight calls, optional rate limiting,
/// and capped exponential retry on 429/5xx and transient network errors.
#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    bearer_token: Option<String>,
    in_flight: Arc<Semaphore>,
    rate_limiter: Option<Arc<RateLimiter>>,
    backoff: BackoffPolicy,
}

impl ApiClient {
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
            bearer_token: config.bearer_token,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            rate_limiter: config.rate_limit.map(|c| Arc::new(RateLimiter::new(c))),
            backoff: config.backoff,
        })
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    /// Send the request and decode the JSON body; empty bodies decode as `null`.
    pub async fn send_json(&self, request: &ApiRequest) -> Result<JsonValue, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;

        let span = info_span!("http_call", method = %request.method, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(&self, request: &ApiRequest) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();

                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        if bytes.iter().all(u8::is_ascii_whitespace) {
                            return Ok(JsonValue::Null);
                        }
                        return serde_json::from_slice(&bytes)
                            .map_err(|source| FetchError::Decode { url, source });
                    }

                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_secs);

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_with_hint(attempt, retry_after);
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying http call");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retrying http call");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_core::AuditStatus;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(id: &str, status: AuditStatus, error: Option<&str>) -> AuditRecord {
        AuditRecord {
            identifier: id.to_string(),
            status,
            properties: BTreeMap::from([("city".to_string(), "Austin, TX".to_string())]),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn csv_escaping_doubles_quotes_and_wraps_special_fields() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
        assert_eq!(csv_line(["1", "x,y", ""]), "1,\"x,y\",\n");
    }

    #[tokio::test]
    async fn checkpoint_round_trips_and_creates_parent_dirs() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("nested/state/checkpoint.json"));

        assert!(store.load().await.is_empty());

        let processed: ProcessedSet = ["3", "1", "2"].into_iter().collect();
        store.save(&processed).await.expect("save");

        let text = std::fs::read_to_string(store.path()).expect("read");
        assert!(text.starts_with("[\n"), "pretty-printed array: {text}");

        let loaded = store.load().await;
        assert_eq!(loaded, processed);
        assert_eq!(loaded.iter().collect::<Vec<_>>(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn malformed_checkpoint_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "{not json").expect("write");

        let store = CheckpointStore::new(&path);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn audit_header_is_written_once_across_appends() {
        let dir = tempdir().expect("tempdir");
        let sink = AuditSink::new(dir.path().join("out/audit.csv"));

        sink.append(&[record("1", AuditStatus::Updated, None)])
            .await
            .expect("first append");
        sink.append(&[record("2", AuditStatus::Error, Some("HTTP 404 \"not found\""))])
            .await
            .expect("second append");
        sink.append(&[]).await.expect("empty append");

        let text = std::fs::read_to_string(sink.path()).expect("read");
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "matchVal,status,properties_json,error");
        assert_eq!(lines[1], r#"1,UPDATED,"{""city"":""Austin, TX""}","#);
        assert_eq!(
            lines[2],
            r#"2,ERROR,"{""city"":""Austin, TX""}","HTTP 404 ""not found""""#
        );
    }

    #[tokio::test]
    async fn csv_file_writer_replaces_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("export.csv");
        let rows = vec![vec!["1".to_string(), "a".to_string()]];
        let count = write_csv_file(&path, &["id", "name"], rows).await.expect("write");
        assert_eq!(count, 1);
        let count = write_csv_file(&path, &["id", "name"], Vec::<Vec<String>>::new())
            .await
            .expect("rewrite");
        assert_eq!(count, 0);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "id,name\n");
    }

    #[test]
    fn backoff_is_exponential_capped_and_honors_retry_after() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(60))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn status_classification_retries_throttling_and_server_errors() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_waits_for_next_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(10),
        });
        let started = tokio::time::Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(9));
    }
}
