use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autolist_adapters::{
    BatchFetchError, BatchSource, FetchContext, Normalizer, RawBatch, SourceProfile,
};
use autolist_core::{
    ActiveListingSnapshot, FeatureCategory, GroupedFeatures, ListingId, NormalizedListing,
    PartitionKey, PartitionStrategy, StoredListing,
};
use autolist_nlp::{
    EntityGroups, FeatureEngine, FeatureMatcher, LazySynonymMatcher, MatcherProvider,
    WordDictionary,
};
use autolist_storage::{InMemoryListingStore, ListingStore, StoreError};
use autolist_sync::{
    Alert, BatchKind, IngestError, IngestPipeline, MemoryNotificationSink, ReconcileError,
    RunOutcome, SourceConfig, SyncConfig,
};
use chrono::Utc;
use tokio::sync::{Notify, Semaphore};

const GROUPS: &str = r#"
comfort_feature:
  heated_seats:
    - heated seats
safety_feature:
  blind_spot_monitoring:
    - blind spot monitor
"#;

struct StaticSource {
    bodies: HashMap<String, String>,
}

impl StaticSource {
    fn new(jobs: &[(&str, String)]) -> Self {
        Self {
            bodies: jobs
                .iter()
                .map(|(job, body)| (job.to_string(), body.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl BatchSource for StaticSource {
    fn source_id(&self) -> &str {
        "audi-dealer"
    }

    async fn fetch_batch(
        &self,
        _ctx: &FetchContext,
        job_id: &str,
    ) -> Result<RawBatch, BatchFetchError> {
        let body = self
            .bodies
            .get(job_id)
            .cloned()
            .ok_or_else(|| BatchFetchError::InvalidJobId(job_id.to_string()))?;
        Ok(RawBatch {
            source_id: "audi-dealer".into(),
            job_id: job_id.into(),
            fetched_from: format!("memory://{job_id}"),
            fetched_at: Utc::now(),
            body,
        })
    }
}

fn record(slug: &str, description: &str) -> String {
    serde_json::json!({
        "listing_url": format!("https://audi.example/{slug}"),
        "year": 2024,
        "make": "audi",
        "model": "Q5",
        "condition": "new",
        "location": "montreal",
        "description": description,
        "image_urls": format!("https://img.audi.example/{slug}.jpg"),
    })
    .to_string()
}

fn batch(slugs: &[&str]) -> String {
    slugs
        .iter()
        .map(|slug| record(slug, "Heated seats and blind spot monitor"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn source_config() -> SourceConfig {
    SourceConfig {
        source_id: "audi-dealer".into(),
        display_name: "Audi Dealer".into(),
        enabled: true,
        batch: BatchKind::Fixture,
        partition: PartitionStrategy::Source,
        url_template: None,
        profile: SourceProfile::default(),
        notes: None,
    }
}

fn feature_engine() -> FeatureEngine {
    let groups = EntityGroups::from_yaml_str(GROUPS).unwrap();
    FeatureEngine::new(
        Arc::new(LazySynonymMatcher::from_groups(groups, 0.8)),
        Arc::new(WordDictionary::from_words(["heated", "seats"])),
    )
}

fn pipeline(
    store: Arc<InMemoryListingStore>,
    sink: Arc<MemoryNotificationSink>,
) -> IngestPipeline {
    IngestPipeline::new(store, sink, feature_engine(), &SyncConfig::default())
        .with_normalizer(Normalizer::new(2025))
}

#[tokio::test]
async fn repeated_jobs_create_update_and_deactivate() {
    let store = Arc::new(InMemoryListingStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let pipeline = pipeline(store.clone(), sink.clone());
    let source = StaticSource::new(&[
        ("first", batch(&["a", "b", "c"])),
        ("second", batch(&["a", "b", "d"])),
    ]);
    let config = source_config();

    let first = pipeline.run_job(&source, &config, "first").await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Completed);
    let plan = first.plan.as_ref().unwrap();
    assert_eq!(plan.creates.len(), 3);
    assert!(plan.updates.is_empty());
    assert_eq!(first.features.len(), 3);
    assert_eq!(first.feature_failures, 0);

    let stored = store
        .find_by_url("https://audi.example/a")
        .await
        .unwrap()
        .expect("listing a stored");
    let grouped = stored.grouped_features.expect("features attached");
    assert_eq!(grouped.get(FeatureCategory::Comfort), ["heated seats"]);
    assert_eq!(grouped.get(FeatureCategory::Safety), ["blind spot monitor"]);
    assert_eq!(stored.listing.make.as_deref(), Some("AUDI"));

    let second = pipeline.run_job(&source, &config, "second").await.unwrap();
    let plan = second.plan.as_ref().unwrap();
    assert_eq!(plan.creates.len(), 1);
    assert_eq!(plan.updates.len(), 2);
    assert_eq!(plan.deactivations.len(), 1);
    assert_eq!(plan.deactivations[0].listing_url, "https://audi.example/c");
    assert!(second.apply.failures.is_empty());

    let c = store
        .find_by_url("https://audi.example/c")
        .await
        .unwrap()
        .unwrap();
    assert!(!c.is_active);
    let snapshot = store
        .fetch_active_partition(&PartitionKey::new("audi-dealer"))
        .await
        .unwrap();
    assert_eq!(snapshot.active_count(), 3);
    assert!(sink.alerts().await.is_empty());
}

#[tokio::test]
async fn suspicious_drop_aborts_without_touching_the_store() {
    let store = Arc::new(InMemoryListingStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let pipeline = pipeline(store.clone(), sink.clone());
    let source = StaticSource::new(&[
        ("full", batch(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"])),
        ("partial", batch(&["a"])),
    ]);
    let config = source_config();

    pipeline.run_job(&source, &config, "full").await.unwrap();
    let err = pipeline
        .run_job(&source, &config, "partial")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::Reconcile(ReconcileError::RatioExceeded { candidates: 9, active: 10, .. })
    ));
    assert!(!err.is_retryable());

    let snapshot = store
        .fetch_active_partition(&PartitionKey::new("audi-dealer"))
        .await
        .unwrap();
    assert_eq!(snapshot.active_count(), 10);

    let alerts = sink.alerts().await;
    assert_eq!(alerts.len(), 1);
    match &alerts[0] {
        Alert::RatioExceeded { ratio, job_id, .. } => {
            assert!((ratio - 0.9).abs() < 1e-9);
            assert_eq!(job_id, "partial");
        }
        other => panic!("unexpected alert {other:?}"),
    }
}

#[tokio::test]
async fn empty_batch_alerts_and_still_writes_reports() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(InMemoryListingStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let pipeline = pipeline(store.clone(), sink.clone()).with_reports_root(reports.path());
    let source = StaticSource::new(&[("empty", "\n\n".to_string())]);

    let summary = pipeline
        .run_job(&source, &source_config(), "empty")
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::EmptyBatch);
    assert!(summary.plan.is_none());
    assert!(store.all_listings().await.is_empty());

    let alerts = sink.alerts().await;
    assert!(matches!(alerts.as_slice(), [Alert::EmptyBatch { .. }]));

    let reports_dir = std::path::PathBuf::from(summary.reports_dir.expect("reports written"));
    assert!(reports_dir.join("daily_brief.md").exists());
    assert!(reports_dir.join("reconciliation_delta.json").exists());
    assert!(reports_dir.join("snapshots/manifest.json").exists());
}

#[tokio::test]
async fn dropped_records_and_missing_images_are_reported_but_not_fatal() {
    let store = Arc::new(InMemoryListingStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let pipeline = pipeline(store.clone(), sink.clone());
    let body = [
        record("a", "heated seats"),
        r#"{"listing_url":"https://audi.example/no-year"}"#.to_string(),
        r#"{"listing_url":"https://audi.example/bare","year":"2023"}"#.to_string(),
    ]
    .join("\n");
    let source = StaticSource::new(&[("mixed", body)]);

    let summary = pipeline
        .run_job(&source, &source_config(), "mixed")
        .await
        .unwrap();
    assert_eq!(summary.records_received, 3);
    assert_eq!(summary.mapping_errors.len(), 1);
    assert_eq!(summary.listings_without_images, 1);
    assert_eq!(summary.plan.as_ref().unwrap().creates.len(), 2);

    let alerts = sink.alerts().await;
    assert!(alerts
        .iter()
        .any(|a| matches!(a, Alert::RecordMappingFailures { total: 1, .. })));
    assert!(alerts.iter().any(|a| matches!(
        a,
        Alert::MissingImages { total: 1, listing_urls, .. }
            if listing_urls == &["https://audi.example/bare".to_string()]
    )));
    assert!(alerts.iter().all(|a| !a.is_action_required()));
}

#[tokio::test]
async fn make_scoped_source_without_a_make_is_a_configuration_error() {
    let store = Arc::new(InMemoryListingStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let pipeline = pipeline(store.clone(), sink.clone());
    let source = StaticSource::new(&[(
        "nomake",
        r#"{"listing_url":"https://mazda.example/1","year":"2024"}"#.to_string(),
    )]);
    let config = SourceConfig {
        partition: PartitionStrategy::Make,
        ..source_config()
    };

    let err = pipeline.run_job(&source, &config, "nomake").await.unwrap_err();
    assert!(matches!(err, IngestError::Configuration(_)));
    assert!(store.all_listings().await.is_empty());
    let alerts = sink.alerts().await;
    assert!(matches!(alerts.last(), Some(Alert::ConfigurationError { .. })));
}

/// Holds the first `matcher()` call until the test opens the gate.
struct GatedProvider {
    inner: LazySynonymMatcher,
    entered: Notify,
    gate: Semaphore,
    armed: AtomicBool,
}

#[async_trait]
impl MatcherProvider for GatedProvider {
    async fn matcher(&self) -> anyhow::Result<Arc<dyn FeatureMatcher>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await?;
        }
        self.inner.matcher().await
    }
}

#[tokio::test]
async fn runs_on_one_partition_attach_features_in_order() {
    let provider = Arc::new(GatedProvider {
        inner: LazySynonymMatcher::from_groups(EntityGroups::from_yaml_str(GROUPS).unwrap(), 0.8),
        entered: Notify::new(),
        gate: Semaphore::new(0),
        armed: AtomicBool::new(true),
    });
    let store = Arc::new(InMemoryListingStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let features = FeatureEngine::new(
        provider.clone(),
        Arc::new(WordDictionary::from_words(["heated", "seats"])),
    );
    let pipeline = IngestPipeline::new(store.clone(), sink, features, &SyncConfig::default())
        .with_normalizer(Normalizer::new(2025));
    let source = StaticSource::new(&[
        ("older", record("x", "heated seats")),
        ("newer", record("x", "blind spot monitor")),
    ]);
    let config = source_config();
    let released = AtomicBool::new(false);
    let newer_may_start = Notify::new();

    let older = pipeline.run_job(&source, &config, "older");
    let newer = async {
        newer_may_start.notified().await;
        let summary = pipeline.run_job(&source, &config, "newer").await;
        assert!(
            released.load(Ordering::SeqCst),
            "newer run finished while the older run still held the partition"
        );
        summary
    };
    let release = async {
        provider.entered.notified().await;
        newer_may_start.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        released.store(true, Ordering::SeqCst);
        provider.gate.add_permits(1);
    };

    let (older, newer, ()) = tokio::join!(older, newer, release);
    older.unwrap();
    let newer = newer.unwrap();
    assert_eq!(newer.plan.as_ref().unwrap().updates.len(), 1);

    let stored = store
        .find_by_url("https://audi.example/x")
        .await
        .unwrap()
        .expect("listing stored");
    assert_eq!(stored.listing.description.as_deref(), Some("blind spot monitor"));
    let grouped = stored.grouped_features.expect("features attached");
    assert!(grouped.get(FeatureCategory::Comfort).is_empty());
    assert_eq!(grouped.get(FeatureCategory::Safety), ["blind spot monitor"]);
}

/// Delegates to an in-memory store but cannot read partitions.
struct UnreadableStore {
    inner: InMemoryListingStore,
}

#[async_trait]
impl ListingStore for UnreadableStore {
    async fn fetch_active_partition(
        &self,
        _partition: &PartitionKey,
    ) -> Result<ActiveListingSnapshot, StoreError> {
        Err(StoreError::Persistence(anyhow::anyhow!("listing store unavailable")))
    }

    async fn upsert_by_url(
        &self,
        partition: &PartitionKey,
        listing: &NormalizedListing,
    ) -> Result<ListingId, StoreError> {
        self.inner.upsert_by_url(partition, listing).await
    }

    async fn set_inactive(&self, id: ListingId) -> Result<(), StoreError> {
        self.inner.set_inactive(id).await
    }

    async fn attach_grouped_features(
        &self,
        id: ListingId,
        features: &GroupedFeatures,
    ) -> Result<(), StoreError> {
        self.inner.attach_grouped_features(id, features).await
    }

    async fn find_by_url(&self, listing_url: &str) -> Result<Option<StoredListing>, StoreError> {
        self.inner.find_by_url(listing_url).await
    }

    async fn listings_missing_features(
        &self,
        after: Option<ListingId>,
        limit: usize,
    ) -> Result<Vec<StoredListing>, StoreError> {
        self.inner.listings_missing_features(after, limit).await
    }
}

#[tokio::test]
async fn store_failure_is_sent_to_the_sink() {
    let store = Arc::new(UnreadableStore {
        inner: InMemoryListingStore::new(),
    });
    let sink = Arc::new(MemoryNotificationSink::new());
    let pipeline = IngestPipeline::new(
        store.clone(),
        sink.clone(),
        feature_engine(),
        &SyncConfig::default(),
    )
    .with_normalizer(Normalizer::new(2025));
    let source = StaticSource::new(&[("one", batch(&["a"]))]);

    let err = pipeline
        .run_job(&source, &source_config(), "one")
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Store(StoreError::Persistence(_))));
    assert!(err.is_retryable());
    assert!(store.inner.all_listings().await.is_empty());

    let alerts = sink.alerts().await;
    match alerts.last() {
        Some(Alert::RunFailed {
            job_id,
            retryable,
            message,
            ..
        }) => {
            assert_eq!(job_id, "one");
            assert!(*retryable);
            assert!(message.contains("listing store unavailable"));
        }
        other => panic!("unexpected alert {other:?}"),
    }
    assert!(alerts.iter().all(|a| a.is_action_required()));
}

#[tokio::test]
async fn report_failure_after_apply_is_sent_to_the_sink() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocked = dir.path().join("reports");
    std::fs::write(&blocked, "not a directory").unwrap();
    let store = Arc::new(InMemoryListingStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let pipeline = pipeline(store.clone(), sink.clone()).with_reports_root(&blocked);
    let source = StaticSource::new(&[("one", batch(&["a", "b"]))]);

    let err = pipeline
        .run_job(&source, &source_config(), "one")
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Report(_)));
    assert_eq!(store.all_listings().await.len(), 2);
    assert!(matches!(
        sink.alerts().await.as_slice(),
        [Alert::RunFailed { retryable: true, .. }]
    ));
}
