//! Batch source contracts, NDJSON batch parsing and the ingestion normalizer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use autolist_core::ScrapedRecord;
use autolist_storage::{FetchError, HttpFetcher, RetryDisposition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

mod normalize;

pub use normalize::{
    MakeHint, NormalizedBatch, Normalizer, RecordMappingError, SourceProfile,
    DEFAULT_PLACEHOLDER_MARKERS,
};

pub const CRATE_NAME: &str = "autolist-adapters";

pub const WEBSCRAPER_URL_TEMPLATE: &str =
    "https://api.webscraper.io/api/v1/scraping-job/{job_id}/json?api_token={api_token}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

/// Undecoded batch body as delivered by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBatch {
    pub source_id: String,
    pub job_id: String,
    pub fetched_from: String,
    pub fetched_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum BatchFetchError {
    #[error("batch fetch for job {job_id} timed out after {after:?}")]
    Timeout { job_id: String, after: Duration },
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
    #[error("job id `{0}` is not a valid batch identifier")]
    InvalidJobId(String),
}

impl BatchFetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http(err) => err.disposition() == RetryDisposition::Retryable,
            Self::Io(_) | Self::InvalidJobId(_) => false,
        }
    }
}

#[async_trait]
pub trait BatchSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_batch(&self, ctx: &FetchContext, job_id: &str)
        -> Result<RawBatch, BatchFetchError>;
}

fn validate_job_id(job_id: &str) -> Result<(), BatchFetchError> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BatchFetchError::InvalidJobId(job_id.to_string()))
    }
}

/// Pulls a finished scraping job's export from webscraper.io.
#[derive(Debug, Clone)]
pub struct WebScraperBatchSource {
    source_id: String,
    url_template: String,
    api_token: Option<String>,
    timeout: Duration,
    http: Arc<HttpFetcher>,
}

impl WebScraperBatchSource {
    pub fn new(
        source_id: impl Into<String>,
        http: Arc<HttpFetcher>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url_template: WEBSCRAPER_URL_TEMPLATE.to_string(),
            api_token,
            timeout,
            http,
        }
    }

    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }

    pub fn job_url(&self, job_id: &str) -> String {
        self.url_template
            .replace("{job_id}", job_id)
            .replace("{api_token}", self.api_token.as_deref().unwrap_or_default())
    }
}

#[async_trait]
impl BatchSource for WebScraperBatchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(
        &self,
        ctx: &FetchContext,
        job_id: &str,
    ) -> Result<RawBatch, BatchFetchError> {
        validate_job_id(job_id)?;
        if self.api_token.is_none() {
            warn!(source_id = %self.source_id, "no webscraper api token configured");
        }
        let url = self.job_url(job_id);
        let fetched = tokio::time::timeout(
            self.timeout,
            self.http.fetch_bytes(ctx.run_id, &self.source_id, &url),
        )
        .await
        .map_err(|_| BatchFetchError::Timeout {
            job_id: job_id.to_string(),
            after: self.timeout,
        })??;

        debug!(
            source_id = %self.source_id,
            job_id,
            bytes = fetched.body.len(),
            "fetched batch"
        );
        Ok(RawBatch {
            source_id: self.source_id.clone(),
            job_id: job_id.to_string(),
            fetched_from: job_id_redacted_url(&self.url_template, job_id),
            fetched_at: ctx.fetched_at,
            body: decode_body(job_id, fetched.body)?,
        })
    }
}

/// Batch bodies must be UTF-8; a corrupted export is rejected rather than patched.
fn decode_body(job_id: &str, body: Vec<u8>) -> Result<String, BatchFetchError> {
    String::from_utf8(body).map_err(|err| {
        let valid_up_to = err.utf8_error().valid_up_to();
        BatchFetchError::Io(
            anyhow::Error::new(err)
                .context(format!("batch for job {job_id} is not UTF-8 after byte {valid_up_to}")),
        )
    })
}

fn job_id_redacted_url(template: &str, job_id: &str) -> String {
    template
        .replace("{job_id}", job_id)
        .replace("{api_token}", "***")
}

/// Reads `<root>/<source_id>/<job_id>.ndjson`.
#[derive(Debug, Clone)]
pub struct FixtureBatchSource {
    source_id: String,
    root: PathBuf,
}

impl FixtureBatchSource {
    pub fn new(source_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
        }
    }

    pub fn batch_path(&self, job_id: &str) -> PathBuf {
        self.root
            .join(&self.source_id)
            .join(format!("{job_id}.ndjson"))
    }
}

#[async_trait]
impl BatchSource for FixtureBatchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(
        &self,
        ctx: &FetchContext,
        job_id: &str,
    ) -> Result<RawBatch, BatchFetchError> {
        validate_job_id(job_id)?;
        let path = self.batch_path(job_id);
        let body = read_fixture(&path).await?;
        Ok(RawBatch {
            source_id: self.source_id.clone(),
            job_id: job_id.to_string(),
            fetched_from: path.display().to_string(),
            fetched_at: ctx.fetched_at,
            body,
        })
    }
}

async fn read_fixture(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading batch fixture {}", path.display()))
}

/// What to do with a batch line that is not a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinePolicy {
    #[default]
    FailFast,
    SkipMalformed,
}

impl FromStr for LinePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "skip_malformed" | "skip-malformed" => Ok(Self::SkipMalformed),
            other => Err(format!("unknown line policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineError {
    pub line_number: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBatch {
    pub records: Vec<ScrapedRecord>,
    pub line_errors: Vec<LineError>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchParseError {
    #[error("malformed batch line {line_number}: {message}")]
    MalformedLine { line_number: usize, message: String },
}

/// Parses one record per non-blank line. A body that is a single JSON array is accepted too.
pub fn parse_batch_lines(body: &str, policy: LinePolicy) -> Result<ParsedBatch, BatchParseError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('[') {
        let records = serde_json::from_str::<Vec<ScrapedRecord>>(trimmed).map_err(|err| {
            BatchParseError::MalformedLine {
                line_number: err.line(),
                message: err.to_string(),
            }
        })?;
        return Ok(ParsedBatch {
            records,
            line_errors: Vec::new(),
        });
    }

    let mut parsed = ParsedBatch::default();
    for (index, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_number = index + 1;
        match serde_json::from_str::<ScrapedRecord>(line) {
            Ok(record) => parsed.records.push(record),
            Err(err) => match policy {
                LinePolicy::FailFast => {
                    return Err(BatchParseError::MalformedLine {
                        line_number,
                        message: err.to_string(),
                    })
                }
                LinePolicy::SkipMalformed => {
                    warn!(line_number, error = %err, "skipping malformed batch line");
                    parsed.line_errors.push(LineError {
                        line_number,
                        message: err.to_string(),
                    });
                }
            },
        }
    }
    Ok(parsed)
}
