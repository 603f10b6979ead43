//! Listing store capability + HTTP fetch utilities for autolist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use autolist_core::{
    ActiveListing, ActiveListingSnapshot, GroupedFeatures, ListingId, NormalizedListing,
    PartitionKey, StoredListing,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "autolist-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {0} not found")]
    NotFound(ListingId),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

/// Operations the pipeline needs from the listing store. Each call is atomic per record.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn fetch_active_partition(
        &self,
        partition: &PartitionKey,
    ) -> Result<ActiveListingSnapshot, StoreError>;

    /// Inserts or overwrites the listing keyed by its url and marks it active.
    async fn upsert_by_url(
        &self,
        partition: &PartitionKey,
        listing: &NormalizedListing,
    ) -> Result<ListingId, StoreError>;

    async fn set_inactive(&self, id: ListingId) -> Result<(), StoreError>;

    async fn attach_grouped_features(
        &self,
        id: ListingId,
        features: &GroupedFeatures,
    ) -> Result<(), StoreError>;

    async fn find_by_url(&self, listing_url: &str) -> Result<Option<StoredListing>, StoreError>;

    /// Listings without grouped features, ordered by id, strictly after `after`.
    async fn listings_missing_features(
        &self,
        after: Option<ListingId>,
        limit: usize,
    ) -> Result<Vec<StoredListing>, StoreError>;
}

#[derive(Debug, Default)]
struct StoreState {
    listings: HashMap<ListingId, StoredListing>,
    by_url: HashMap<String, ListingId>,
}

impl StoreState {
    fn from_listings(listings: Vec<StoredListing>) -> Self {
        let mut state = Self::default();
        for stored in listings {
            state
                .by_url
                .insert(stored.listing.listing_url.clone(), stored.id);
            state.listings.insert(stored.id, stored);
        }
        state
    }

    fn sorted_listings(&self) -> Vec<StoredListing> {
        let mut all = self.listings.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    fn active_partition(&self, partition: &PartitionKey) -> ActiveListingSnapshot {
        let mut entries = self
            .listings
            .values()
            .filter(|l| l.is_active && &l.partition == partition)
            .map(|l| ActiveListing {
                id: l.id,
                listing_url: l.listing.listing_url.clone(),
                is_active: l.is_active,
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.listing_url.cmp(&b.listing_url));
        ActiveListingSnapshot {
            partition: partition.clone(),
            entries,
        }
    }

    fn upsert(
        &mut self,
        partition: &PartitionKey,
        listing: &NormalizedListing,
        now: DateTime<Utc>,
    ) -> ListingId {
        if let Some(id) = self.by_url.get(&listing.listing_url).copied() {
            if let Some(existing) = self.listings.get_mut(&id) {
                if existing.listing.description != listing.description {
                    existing.grouped_features = None;
                }
                existing.partition = partition.clone();
                existing.listing = listing.clone();
                existing.is_active = true;
                existing.updated_at = now;
                return id;
            }
        }

        let id = ListingId::new_v4();
        self.by_url.insert(listing.listing_url.clone(), id);
        self.listings.insert(
            id,
            StoredListing {
                id,
                partition: partition.clone(),
                listing: listing.clone(),
                is_active: true,
                grouped_features: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn set_inactive(&mut self, id: ListingId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let stored = self.listings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        stored.is_active = false;
        stored.updated_at = now;
        Ok(())
    }

    fn attach(&mut self, id: ListingId, features: &GroupedFeatures) -> Result<(), StoreError> {
        let stored = self.listings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        stored.grouped_features = Some(features.clone());
        Ok(())
    }

    fn find_by_url(&self, listing_url: &str) -> Option<StoredListing> {
        self.by_url
            .get(listing_url)
            .and_then(|id| self.listings.get(id))
            .cloned()
    }

    fn missing_features(&self, after: Option<ListingId>, limit: usize) -> Vec<StoredListing> {
        let mut missing = self
            .listings
            .values()
            .filter(|l| l.grouped_features.is_none())
            .filter(|l| after.map_or(true, |cursor| l.id > cursor))
            .cloned()
            .collect::<Vec<_>>();
        missing.sort_by_key(|l| l.id);
        missing.truncate(limit);
        missing
    }
}

/// Process-local store. A single lock serializes all writes, including writes to the same url.
#[derive(Debug, Default)]
pub struct InMemoryListingStore {
    state: Mutex<StoreState>,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_listings(&self) -> Vec<StoredListing> {
        self.state.lock().await.sorted_listings()
    }
}

#[async_trait]
impl ListingStore for InMemoryListingStore {
    async fn fetch_active_partition(
        &self,
        partition: &PartitionKey,
    ) -> Result<ActiveListingSnapshot, StoreError> {
        Ok(self.state.lock().await.active_partition(partition))
    }

    async fn upsert_by_url(
        &self,
        partition: &PartitionKey,
        listing: &NormalizedListing,
    ) -> Result<ListingId, StoreError> {
        Ok(self.state.lock().await.upsert(partition, listing, Utc::now()))
    }

    async fn set_inactive(&self, id: ListingId) -> Result<(), StoreError> {
        self.state.lock().await.set_inactive(id, Utc::now())
    }

    async fn attach_grouped_features(
        &self,
        id: ListingId,
        features: &GroupedFeatures,
    ) -> Result<(), StoreError> {
        self.state.lock().await.attach(id, features)
    }

    async fn find_by_url(&self, listing_url: &str) -> Result<Option<StoredListing>, StoreError> {
        Ok(self.state.lock().await.find_by_url(listing_url))
    }

    async fn listings_missing_features(
        &self,
        after: Option<ListingId>,
        limit: usize,
    ) -> Result<Vec<StoredListing>, StoreError> {
        Ok(self.state.lock().await.missing_features(after, limit))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    listings: Vec<StoredListing>,
}

/// Store persisted as one JSON document, rewritten atomically after every mutation.
#[derive(Debug)]
pub struct JsonFileListingStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileListingStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking store path {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            StoreState::from_listings(file.listings)
        } else {
            StoreState::default()
        };
        debug!(path = %path.display(), listings = state.listings.len(), "opened listing store");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let file = StoreFile {
            listings: state.sorted_listings(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing listing store")?;
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for JsonFileListingStore {
    async fn fetch_active_partition(
        &self,
        partition: &PartitionKey,
    ) -> Result<ActiveListingSnapshot, StoreError> {
        Ok(self.state.lock().await.active_partition(partition))
    }

    async fn upsert_by_url(
        &self,
        partition: &PartitionKey,
        listing: &NormalizedListing,
    ) -> Result<ListingId, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.upsert(partition, listing, Utc::now());
        self.persist(&state).await?;
        Ok(id)
    }

    async fn set_inactive(&self, id: ListingId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.set_inactive(id, Utc::now())?;
        self.persist(&state).await
    }

    async fn attach_grouped_features(
        &self,
        id: ListingId,
        features: &GroupedFeatures,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.attach(id, features)?;
        self.persist(&state).await
    }

    async fn find_by_url(&self, listing_url: &str) -> Result<Option<StoredListing>, StoreError> {
        Ok(self.state.lock().await.find_by_url(listing_url))
    }

    async fn listings_missing_features(
        &self,
        after: Option<ListingId>,
        limit: usize,
    ) -> Result<Vec<StoredListing>, StoreError> {
        Ok(self.state.lock().await.missing_features(after, limit))
    }
}

/// Write bytes via a uniquely named temp file in the target directory, then rename over the target.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
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
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
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
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::LimiterClosed => RetryDisposition::NonRetryable,
        }
    }
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
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url`, retrying transient failures with capped exponential backoff.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        async move {
            let mut attempt = 0usize;
            loop {
                let failure = match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        }
                    }
                    Err(err) => FetchError::Request(err),
                };

                if failure.disposition() == RetryDisposition::Retryable
                    && attempt < self.backoff.max_retries
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %failure, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(failure);
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn listing(url: &str, description: Option<&str>) -> NormalizedListing {
        NormalizedListing {
            source_id: "audi-dealer".into(),
            listing_url: url.into(),
            year: "2024".into(),
            make: Some("AUDI".into()),
            model: Some("Q5".into()),
            price: Some("$48,900".into()),
            condition: Some("NEW".into()),
            location: Some("MONTREAL".into()),
            vehicle_type: None,
            transmission: None,
            mileage: None,
            engine: None,
            cylinders: None,
            exterior: None,
            interior: None,
            description: description.map(Into::into),
            image_urls: vec![],
            vin: None,
            drive_train: None,
            fuel_type: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_url_and_reactivates() {
        let store = InMemoryListingStore::new();
        let partition = PartitionKey::new("audi-dealer");
        let first = store
            .upsert_by_url(&partition, &listing("https://a.example/1", None))
            .await
            .unwrap();
        store.set_inactive(first).await.unwrap();
        assert_eq!(store.fetch_active_partition(&partition).await.unwrap().active_count(), 0);

        let second = store
            .upsert_by_url(&partition, &listing("https://a.example/1", Some("updated")))
            .await
            .unwrap();
        assert_eq!(first, second);
        let snapshot = store.fetch_active_partition(&partition).await.unwrap();
        assert_eq!(snapshot.active_count(), 1);
        assert_eq!(store.all_listings().await.len(), 1);
    }

    #[tokio::test]
    async fn set_inactive_reports_vanished_ids() {
        let store = InMemoryListingStore::new();
        let missing = ListingId::new_v4();
        let err = store.set_inactive(missing).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn description_change_clears_stale_features() {
        let store = InMemoryListingStore::new();
        let partition = PartitionKey::new("audi-dealer");
        let id = store
            .upsert_by_url(&partition, &listing("https://a.example/2", Some("sunroof")))
            .await
            .unwrap();
        store
            .attach_grouped_features(id, &GroupedFeatures::default())
            .await
            .unwrap();
        assert!(store.listings_missing_features(None, 10).await.unwrap().is_empty());

        store
            .upsert_by_url(&partition, &listing("https://a.example/2", Some("panoramic sunroof")))
            .await
            .unwrap();
        let missing = store.listings_missing_features(None, 10).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert!(store
            .listings_missing_features(Some(missing[0].id), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("listings.json");
        let partition = PartitionKey::new("audi-dealer");

        let store = JsonFileListingStore::open(&path).await.unwrap();
        let id = store
            .upsert_by_url(&partition, &listing("https://a.example/3", None))
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileListingStore::open(&path).await.unwrap();
        let found = reopened
            .find_by_url("https://a.example/3")
            .await
            .unwrap()
            .expect("listing persisted");
        assert_eq!(found.id, id);
        assert!(found.is_active);
        assert_eq!(
            reopened.fetch_active_partition(&partition).await.unwrap().entries.len(),
            1
        );
    }

    #[test]
    fn default_backoff_doubles_from_half_a_second_up_to_eight() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 3);
        let delays: Vec<_> = (0..7).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            [500, 1_000, 2_000, 4_000, 8_000, 8_000, 8_000].map(Duration::from_millis)
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(8));
    }

    #[test]
    fn http_status_errors_classify_by_status() {
        let unavailable = FetchError::HttpStatus {
            status: 503,
            url: "https://api.example/job".into(),
        };
        let forbidden = FetchError::HttpStatus {
            status: 403,
            url: "https://api.example/job".into(),
        };
        assert_eq!(unavailable.disposition(), RetryDisposition::Retryable);
        assert_eq!(forbidden.disposition(), RetryDisposition::NonRetryable);
    }
}
