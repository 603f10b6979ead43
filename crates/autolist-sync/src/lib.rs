//! Ingest orchestration: reconciliation, feature extraction, reports and the backfill scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autolist_adapters::{
    BatchSource, FixtureBatchSource, LinePolicy, SourceProfile, WebScraperBatchSource,
};
use autolist_core::PartitionStrategy;
use autolist_nlp::{FeatureEngine, LazySynonymMatcher, WordDictionary, DEFAULT_MATCH_THRESHOLD};
use autolist_storage::{HttpClientConfig, HttpFetcher, JsonFileListingStore, ListingStore};
use serde::{Deserialize, Serialize};

pub mod notify;
pub mod pipeline;
pub mod reconcile;
pub mod report;

pub use notify::{Alert, MemoryNotificationSink, NotificationSink, TracingNotificationSink};
pub use pipeline::{
    backfill_grouped_features, maybe_build_scheduler, BackfillSummary, IngestError,
    IngestPipeline, ListingFeatures, RunOutcome, RunSummary,
};
pub use reconcile::{
    apply_plan, ApplyReport, InstructionKind, ReconcileConfig, ReconcileError,
    ReconciliationEngine, DEFAULT_DEACTIVATION_THRESHOLD,
};
pub use report::{export_parquet_snapshots, report_daily_markdown, write_reports, ParquetManifest};

pub const CRATE_NAME: &str = "autolist-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    #[default]
    Webscraper,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> + '_ {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub batch: BatchKind,
    #[serde(default)]
    pub partition: PartitionStrategy,
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(flatten)]
    pub profile: SourceProfile,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub store_path: PathBuf,
    pub deactivation_threshold: f64,
    pub line_policy: LinePolicy,
    pub match_threshold: f64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub webscraper_api_token: Option<String>,
    pub scheduler_enabled: bool,
    pub backfill_cron: String,
    pub apply_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            store_path: PathBuf::from("./data/listings.json"),
            deactivation_threshold: DEFAULT_DEACTIVATION_THRESHOLD,
            line_policy: LinePolicy::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            http_timeout_secs: 30,
            user_agent: "autolist-bot/0.1".to_string(),
            webscraper_api_token: None,
            scheduler_enabled: false,
            backfill_cron: "0 15 11,23 * * *".to_string(),
            apply_concurrency: 8,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("AUTOLIST_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            store_path: std::env::var("AUTOLIST_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            deactivation_threshold: env_parsed("AUTOLIST_DEACTIVATION_THRESHOLD")
                .unwrap_or(defaults.deactivation_threshold),
            line_policy: env_parsed("AUTOLIST_LINE_POLICY").unwrap_or(defaults.line_policy),
            match_threshold: env_parsed("AUTOLIST_MATCH_THRESHOLD")
                .unwrap_or(defaults.match_threshold),
            http_timeout_secs: env_parsed("AUTOLIST_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("AUTOLIST_USER_AGENT").unwrap_or(defaults.user_agent),
            webscraper_api_token: std::env::var("WEBSCRAPER_API_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scheduler_enabled: std::env::var("AUTOLIST_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            backfill_cron: std::env::var("BACKFILL_CRON").unwrap_or(defaults.backfill_cron),
            apply_concurrency: env_parsed("AUTOLIST_APPLY_CONCURRENCY")
                .unwrap_or(defaults.apply_concurrency),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn entity_groups_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("entity-groups.yaml")
    }

    pub fn dictionary_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("english-words.txt")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
    }

    /// Feature engine over the workspace rules; the matcher itself trains on first use.
    pub fn feature_engine(&self) -> Result<FeatureEngine> {
        let dictionary = WordDictionary::load(self.dictionary_path())?;
        let matcher = LazySynonymMatcher::from_path(self.entity_groups_path(), self.match_threshold);
        Ok(FeatureEngine::new(Arc::new(matcher), Arc::new(dictionary)))
    }

    pub fn batch_source(
        &self,
        source: &SourceConfig,
        http: Arc<HttpFetcher>,
    ) -> Arc<dyn BatchSource> {
        match source.batch {
            BatchKind::Fixture => Arc::new(FixtureBatchSource::new(
                source.source_id.clone(),
                self.fixtures_dir(),
            )),
            BatchKind::Webscraper => {
                let web = WebScraperBatchSource::new(
                    source.source_id.clone(),
                    http,
                    self.webscraper_api_token.clone(),
                    Duration::from_secs(self.http_timeout_secs),
                );
                match &source.url_template {
                    Some(template) => Arc::new(web.with_url_template(template.clone())),
                    None => Arc::new(web),
                }
            }
        }
    }
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn ListingStore>> {
    Ok(Arc::new(JsonFileListingStore::open(&config.store_path).await?))
}

/// Runs one scraping job end to end with the JSON file store and tracing alerts.
pub async fn run_ingest_from_env(source_id: &str, job_id: &str) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(config.sources_path())?;
    let source = registry
        .find(source_id)
        .with_context(|| format!("source `{source_id}` is not declared in sources.yaml"))?;
    if !source.enabled {
        anyhow::bail!("source `{source_id}` is disabled in sources.yaml");
    }

    let store = open_store(&config).await?;
    let http = Arc::new(config.http_fetcher()?);
    let batch_source = config.batch_source(source, http);
    let pipeline = IngestPipeline::new(
        store,
        Arc::new(TracingNotificationSink),
        config.feature_engine()?,
        &config,
    )
    .with_reports_root(config.reports_dir());

    Ok(pipeline
        .run_job(batch_source.as_ref(), source, job_id)
        .await?)
}

pub async fn run_backfill_from_env(batch_size: usize) -> Result<BackfillSummary> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    let features = config.feature_engine()?;
    Ok(backfill_grouped_features(store, &features, batch_size).await?)
}

/// Builds the backfill scheduler against the configured store, if scheduling is enabled.
pub async fn scheduler_from_env() -> Result<Option<tokio_cron_scheduler::JobScheduler>> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    let features = config.feature_engine()?;
    maybe_build_scheduler(&config, store, features).await
}
