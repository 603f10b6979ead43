//! One scraping job end to end, plus the grouped-features backfill and its scheduler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autolist_adapters::{
    parse_batch_lines, BatchFetchError, BatchParseError, BatchSource, FetchContext, LineError,
    LinePolicy, Normalizer, RecordMappingError,
};
use autolist_core::{ConfigurationError, GroupedFeatures, ListingId, PartitionKey, ReconciliationPlan};
use autolist_nlp::FeatureEngine;
use autolist_storage::{ListingStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::notify::{capped, Alert, NotificationSink};
use crate::reconcile::{apply_plan, ApplyReport, InstructionKind, ReconcileConfig, ReconcileError, ReconciliationEngine};
use crate::report::{export_parquet_snapshots, write_reports};
use crate::{SourceConfig, SyncConfig};

pub const DEFAULT_BACKFILL_BATCH_SIZE: usize = 100;
const BACKFILL_PROGRESS_EVERY: usize = 50;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("batch fetch failed: {0}")]
    Fetch(#[from] BatchFetchError),
    #[error("batch rejected: {0}")]
    Parse(#[from] BatchParseError),
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("listing store failed: {0}")]
    Store(#[from] StoreError),
    #[error("writing run reports failed: {0:#}")]
    Report(anyhow::Error),
}

impl IngestError {
    /// Transient failures worth retrying; everything else needs an operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_retryable(),
            Self::Store(StoreError::Persistence(_)) | Self::Report(_) => true,
            Self::Store(StoreError::NotFound(_))
            | Self::Parse(_)
            | Self::Configuration(_)
            | Self::Reconcile(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    EmptyBatch,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::EmptyBatch => "empty_batch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingFeatures {
    pub listing_id: ListingId,
    pub listing_url: String,
    pub grouped_features: GroupedFeatures,
    pub top_intent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub records_received: usize,
    pub line_errors: Vec<LineError>,
    pub mapping_errors: Vec<RecordMappingError>,
    pub listings_without_images: usize,
    pub plan: Option<ReconciliationPlan>,
    pub apply: ApplyReport,
    pub features: Vec<ListingFeatures>,
    pub feature_failures: usize,
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

pub struct IngestPipeline {
    store: Arc<dyn ListingStore>,
    notifier: Arc<dyn NotificationSink>,
    features: FeatureEngine,
    engine: ReconciliationEngine,
    normalizer: Normalizer,
    line_policy: LinePolicy,
    concurrency: usize,
    reports_root: Option<PathBuf>,
    partition_locks: Mutex<HashMap<PartitionKey, Arc<Mutex<()>>>>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn ListingStore>,
        notifier: Arc<dyn NotificationSink>,
        features: FeatureEngine,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            features,
            engine: ReconciliationEngine::new(ReconcileConfig {
                deactivation_threshold: config.deactivation_threshold,
            }),
            normalizer: Normalizer::for_today(),
            line_policy: config.line_policy,
            concurrency: config.apply_concurrency.max(1),
            reports_root: None,
            partition_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Write `daily_brief.md`, the delta JSON and parquet snapshots under `<root>/<run_id>/`.
    pub fn with_reports_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.reports_root = Some(root.into());
        self
    }

    async fn partition_lock(&self, partition: &PartitionKey) -> Arc<Mutex<()>> {
        let mut locks = self.partition_locks.lock().await;
        locks
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn run_job(
        &self,
        source: &dyn BatchSource,
        config: &SourceConfig,
        job_id: &str,
    ) -> Result<RunSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source_id = %config.source_id, job_id);
        self.run_job_inner(run_id, source, config, job_id)
            .instrument(span)
            .await
    }

    async fn run_job_inner(
        &self,
        run_id: Uuid,
        source: &dyn BatchSource,
        config: &SourceConfig,
        job_id: &str,
    ) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();
        let source_id = config.source_id.clone();
        let alert_ids = || (source_id.clone(), job_id.to_string());

        let raw = match source.fetch_batch(&FetchContext::new(run_id), job_id).await {
            Ok(raw) => raw,
            Err(err) => {
                let (source_id, job_id) = alert_ids();
                self.notifier
                    .notify(Alert::BatchFetchFailed {
                        source_id,
                        job_id,
                        message: err.to_string(),
                        retryable: err.is_retryable(),
                    })
                    .await;
                return Err(err.into());
            }
        };

        let parsed = match parse_batch_lines(&raw.body, self.line_policy) {
            Ok(parsed) => parsed,
            Err(err) => {
                let (source_id, job_id) = alert_ids();
                self.notifier
                    .notify(Alert::BatchFetchFailed {
                        source_id,
                        job_id,
                        message: err.to_string(),
                        retryable: false,
                    })
                    .await;
                return Err(err.into());
            }
        };
        if !parsed.line_errors.is_empty() {
            let (total, samples) = capped(
                parsed
                    .line_errors
                    .iter()
                    .map(|e| format!("line {}: {}", e.line_number, e.message)),
            );
            let (source_id, job_id) = alert_ids();
            self.notifier
                .notify(Alert::SkippedLines {
                    source_id,
                    job_id,
                    total,
                    samples,
                })
                .await;
        }

        let mut summary = RunSummary {
            run_id,
            source_id: source_id.clone(),
            job_id: job_id.to_string(),
            started_at,
            finished_at: started_at,
            outcome: RunOutcome::Completed,
            records_received: parsed.records.len(),
            line_errors: parsed.line_errors.clone(),
            mapping_errors: Vec::new(),
            listings_without_images: 0,
            plan: None,
            apply: ApplyReport::default(),
            features: Vec::new(),
            feature_failures: 0,
            reports_dir: None,
            parquet_manifest: None,
        };

        if parsed.records.is_empty() {
            warn!("empty batch; nothing to reconcile");
            {
                let (source_id, job_id) = alert_ids();
                self.notifier
                    .notify(Alert::EmptyBatch { source_id, job_id })
                    .await;
            }
            summary.outcome = RunOutcome::EmptyBatch;
            summary.finished_at = Utc::now();
            if let Err(err) = self.write_run_reports(&mut summary).await {
                return Err(self.notify_run_failed(&source_id, job_id, err).await);
            }
            return Ok(summary);
        }

        let normalized = self
            .normalizer
            .normalize_batch(&source_id, &config.profile, &parsed.records);
        if !normalized.mapping_errors.is_empty() {
            let (total, samples) = capped(normalized.mapping_errors.iter().map(|e| e.to_string()));
            let (source_id, job_id) = alert_ids();
            self.notifier
                .notify(Alert::RecordMappingFailures {
                    source_id,
                    job_id,
                    total,
                    samples,
                })
                .await;
        }
        let (missing_images, listing_urls) =
            capped(normalized.without_images().map(|l| l.listing_url.clone()));
        if missing_images > 0 {
            let (source_id, job_id) = alert_ids();
            self.notifier
                .notify(Alert::MissingImages {
                    source_id,
                    job_id,
                    total: missing_images,
                    listing_urls,
                })
                .await;
        }
        summary.mapping_errors = normalized.mapping_errors.clone();
        summary.listings_without_images = missing_images;

        let partition = match config
            .partition
            .resolve(&source_id, normalized.listings.first())
        {
            Ok(partition) => partition,
            Err(err) => {
                self.notify_configuration(&source_id, job_id, &err).await;
                return Err(err.into());
            }
        };

        let lock = self.partition_lock(&partition).await;
        let guard = lock.lock().await;

        let snapshot = match self.store.fetch_active_partition(&partition).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return Err(self
                    .notify_run_failed(&source_id, job_id, err.into())
                    .await);
            }
        };
        let plan = match self.engine.plan(&partition, &normalized.listings, &snapshot) {
            Ok(plan) => plan,
            Err(err) => {
                match &err {
                    ReconcileError::RatioExceeded {
                        partition,
                        ratio,
                        threshold,
                        candidates,
                        active,
                    } => {
                        let (source_id, job_id) = alert_ids();
                        self.notifier
                            .notify(Alert::RatioExceeded {
                                source_id,
                                job_id,
                                partition: partition.to_string(),
                                ratio: *ratio,
                                threshold: *threshold,
                                candidates: *candidates,
                                active: *active,
                            })
                            .await;
                    }
                    ReconcileError::Configuration(config_err) => {
                        self.notify_configuration(&source_id, job_id, config_err)
                            .await;
                    }
                }
                return Err(err.into());
            }
        };

        let apply = apply_plan(self.store.clone(), &plan, self.concurrency).await;
        info!(
            partition = %partition,
            created = apply.count(InstructionKind::Create),
            updated = apply.count(InstructionKind::Update),
            deactivated = apply.count(InstructionKind::Deactivate),
            failures = apply.failures.len(),
            "plan applied"
        );

        let descriptions: HashMap<&str, Option<String>> = plan
            .creates
            .iter()
            .map(|c| (c.listing.listing_url.as_str(), c.listing.description.clone()))
            .chain(
                plan.updates
                    .iter()
                    .map(|u| (u.listing.listing_url.as_str(), u.listing.description.clone())),
            )
            .collect();
        let targets = apply
            .upserted()
            .map(|a| {
                let description = descriptions.get(a.listing_url.as_str()).cloned().flatten();
                (a.id, a.listing_url.clone(), description)
            })
            .collect::<Vec<_>>();
        // The partition stays locked until features are attached.
        let (features, feature_failures) = self.extract_and_attach(targets).await;
        drop(guard);

        summary.plan = Some(plan);
        summary.apply = apply;
        summary.features = features;
        summary.feature_failures = feature_failures;
        summary.finished_at = Utc::now();
        if let Err(err) = self.write_run_reports(&mut summary).await {
            return Err(self.notify_run_failed(&source_id, job_id, err).await);
        }
        Ok(summary)
    }

    async fn notify_configuration(&self, source_id: &str, job_id: &str, err: &ConfigurationError) {
        self.notifier
            .notify(Alert::ConfigurationError {
                source_id: source_id.to_string(),
                job_id: job_id.to_string(),
                message: err.to_string(),
            })
            .await;
    }

    async fn notify_run_failed(
        &self,
        source_id: &str,
        job_id: &str,
        err: IngestError,
    ) -> IngestError {
        error!(error = %err, "ingest run failed");
        self.notifier
            .notify(Alert::RunFailed {
                source_id: source_id.to_string(),
                job_id: job_id.to_string(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            })
            .await;
        err
    }

    async fn extract_and_attach(
        &self,
        targets: Vec<(ListingId, String, Option<String>)>,
    ) -> (Vec<ListingFeatures>, usize) {
        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (id, listing_url, description) in targets {
            let features = self.features.clone();
            let store = self.store.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let extraction = features
                    .extract(description.as_deref())
                    .await
                    .map_err(|e| e.to_string())?;
                store
                    .attach_grouped_features(id, &extraction.grouped_features)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok::<_, String>(ListingFeatures {
                    listing_id: id,
                    listing_url,
                    grouped_features: extraction.grouped_features,
                    top_intent: extraction.top_intent,
                })
            });
        }

        let mut extracted = Vec::new();
        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(features)) => extracted.push(features),
                Ok(Err(message)) => {
                    warn!(error = %message, "feature extraction failed for listing");
                    failures += 1;
                }
                Err(err) => {
                    error!(error = %err, "feature extraction task aborted");
                    failures += 1;
                }
            }
        }
        extracted.sort_by(|a, b| a.listing_url.cmp(&b.listing_url));
        (extracted, failures)
    }

    async fn write_run_reports(&self, summary: &mut RunSummary) -> Result<(), IngestError> {
        let Some(root) = &self.reports_root else {
            return Ok(());
        };
        let reports_dir = write_reports(root, summary)
            .await
            .map_err(IngestError::Report)?;
        let manifest = export_parquet_snapshots(&reports_dir, summary)
            .await
            .map_err(IngestError::Report)?;
        summary.reports_dir = Some(reports_dir.display().to_string());
        summary.parquet_manifest = Some(manifest.display().to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub processed: usize,
    pub updated: usize,
    pub errors: usize,
}

/// Attaches grouped features to every stored listing that lacks them, page by page.
pub async fn backfill_grouped_features(
    store: Arc<dyn ListingStore>,
    features: &FeatureEngine,
    batch_size: usize,
) -> Result<BackfillSummary, StoreError> {
    let batch_size = if batch_size == 0 {
        DEFAULT_BACKFILL_BATCH_SIZE
    } else {
        batch_size
    };
    let mut summary = BackfillSummary::default();
    let mut cursor: Option<ListingId> = None;

    loop {
        let page = store.listings_missing_features(cursor, batch_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(last.id);

        for listing in page {
            summary.processed += 1;
            let attached = match features.extract(listing.listing.description.as_deref()).await {
                Ok(extraction) => store
                    .attach_grouped_features(listing.id, &extraction.grouped_features)
                    .await
                    .map_err(|e| e.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match attached {
                Ok(()) => summary.updated += 1,
                Err(message) => {
                    summary.errors += 1;
                    warn!(listing_id = %listing.id, error = %message, "backfill failed for listing");
                }
            }
            if summary.processed % BACKFILL_PROGRESS_EVERY == 0 {
                info!(
                    processed = summary.processed,
                    updated = summary.updated,
                    errors = summary.errors,
                    "backfill progress"
                );
            }
        }
    }

    info!(
        processed = summary.processed,
        updated = summary.updated,
        errors = summary.errors,
        "backfill finished"
    );
    Ok(summary)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    store: Arc<dyn ListingStore>,
    features: FeatureEngine,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.backfill_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let store = store.clone();
        let features = features.clone();
        Box::pin(async move {
            match backfill_grouped_features(store, &features, DEFAULT_BACKFILL_BATCH_SIZE).await {
                Ok(summary) => info!(?summary, "scheduled backfill complete"),
                Err(err) => error!(error = %err, "scheduled backfill failed"),
            }
        })
    })
    .with_context(|| format!("creating backfill job for cron {cron}"))?;
    sched.add(job).await.context("adding backfill job")?;
    Ok(Some(sched))
}
