//! Operator alerts. Delivery is fire-and-forget; a sink never fails the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Upper bound on the per-alert detail list; totals are always reported in full.
pub const ALERT_DETAIL_CAP: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    EmptyBatch {
        source_id: String,
        job_id: String,
    },
    RecordMappingFailures {
        source_id: String,
        job_id: String,
        total: usize,
        samples: Vec<String>,
    },
    SkippedLines {
        source_id: String,
        job_id: String,
        total: usize,
        samples: Vec<String>,
    },
    MissingImages {
        source_id: String,
        job_id: String,
        total: usize,
        listing_urls: Vec<String>,
    },
    RatioExceeded {
        source_id: String,
        job_id: String,
        partition: String,
        ratio: f64,
        threshold: f64,
        candidates: usize,
        active: usize,
    },
    ConfigurationError {
        source_id: String,
        job_id: String,
        message: String,
    },
    BatchFetchFailed {
        source_id: String,
        job_id: String,
        message: String,
        retryable: bool,
    },
    RunFailed {
        source_id: String,
        job_id: String,
        message: String,
        retryable: bool,
    },
}

impl Alert {
    /// Alerts that block ingestion until someone looks at the scrape or the config.
    pub fn is_action_required(&self) -> bool {
        matches!(
            self,
            Self::EmptyBatch { .. }
                | Self::RatioExceeded { .. }
                | Self::ConfigurationError { .. }
                | Self::BatchFetchFailed { .. }
                | Self::RunFailed { .. }
        )
    }

    pub fn summary(&self) -> String {
        match self {
            Self::EmptyBatch { source_id, job_id } => {
                format!("{source_id} job {job_id} returned an empty batch; please investigate the scrape")
            }
            Self::RecordMappingFailures {
                source_id,
                job_id,
                total,
                ..
            } => format!("{source_id} job {job_id}: {total} records dropped for missing listing_url or year"),
            Self::SkippedLines {
                source_id,
                job_id,
                total,
                ..
            } => format!("{source_id} job {job_id}: {total} malformed lines skipped"),
            Self::MissingImages {
                source_id,
                job_id,
                total,
                ..
            } => format!("{source_id} job {job_id}: {total} listings have no usable images"),
            Self::RatioExceeded {
                source_id,
                job_id,
                partition,
                ratio,
                ..
            } => format!(
                "{source_id} job {job_id}: {:.1}% of active listings in {partition} would be deactivated; run aborted, please verify the scraping job",
                ratio * 100.0
            ),
            Self::ConfigurationError {
                source_id,
                job_id,
                message,
            } => format!("{source_id} job {job_id}: configuration error: {message}"),
            Self::BatchFetchFailed {
                source_id,
                job_id,
                message,
                retryable,
            } => format!(
                "{source_id} job {job_id}: batch fetch failed ({}): {message}",
                if *retryable { "retryable" } else { "not retryable" }
            ),
            Self::RunFailed {
                source_id,
                job_id,
                message,
                retryable,
            } => format!(
                "{source_id} job {job_id}: run failed ({}): {message}",
                if *retryable { "retryable" } else { "not retryable" }
            ),
        }
    }
}

/// Splits a list into its full length and a capped sample.
pub fn capped<I, T>(items: I) -> (usize, Vec<T>)
where
    I: IntoIterator<Item = T>,
{
    let mut total = 0;
    let mut sample = Vec::new();
    for item in items {
        total += 1;
        if sample.len() < ALERT_DETAIL_CAP {
            sample.push(item);
        }
    }
    (total, sample)
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, alert: Alert);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, alert: Alert) {
        if alert.is_action_required() {
            error!(alert = ?alert, "action required: {}", alert.summary());
        } else {
            warn!(alert = ?alert, "{}", alert.summary());
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}
