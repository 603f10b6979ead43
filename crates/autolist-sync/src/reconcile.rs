//! Active-set reconciliation with a deactivation-ratio circuit breaker, and plan application.

use std::collections::HashMap;
use std::sync::Arc;

use autolist_core::{
    ActiveListingSnapshot, ConfigurationError, CreateInstruction, DeactivateInstruction, ListingId,
    NormalizedListing, PartitionKey, ReconciliationPlan, UpdateInstruction,
};
use autolist_storage::{ListingStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_DEACTIVATION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(
        "refusing to deactivate {candidates} of {active} active listings in `{partition}` \
         (ratio {ratio:.3} > threshold {threshold:.3})"
    )]
    RatioExceeded {
        partition: PartitionKey,
        ratio: f64,
        threshold: f64,
        candidates: usize,
        active: usize,
    },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub deactivation_threshold: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            deactivation_threshold: DEFAULT_DEACTIVATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine {
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    /// Builds the full plan for one partition, or refuses when too many listings would vanish.
    pub fn plan(
        &self,
        partition: &PartitionKey,
        batch: &[NormalizedListing],
        snapshot: &ActiveListingSnapshot,
    ) -> Result<ReconciliationPlan, ReconcileError> {
        let threshold = self.config.deactivation_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigurationError::Invalid(format!(
                "deactivation threshold {threshold} is outside [0, 1]"
            ))
            .into());
        }
        if &snapshot.partition != partition {
            return Err(ConfigurationError::SnapshotPartitionMismatch {
                requested: partition.to_string(),
                snapshot: snapshot.partition.to_string(),
            }
            .into());
        }

        let listings = collapse_duplicate_urls(batch);
        let incoming: HashMap<&str, &NormalizedListing> = listings
            .iter()
            .map(|l| (l.listing_url.as_str(), *l))
            .collect();

        let candidates = snapshot
            .entries
            .iter()
            .filter(|e| e.is_active && !incoming.contains_key(e.listing_url.as_str()))
            .collect::<Vec<_>>();
        let active = snapshot.active_count();
        let ratio = if active == 0 {
            0.0
        } else {
            candidates.len() as f64 / active as f64
        };

        if ratio > threshold {
            return Err(ReconcileError::RatioExceeded {
                partition: partition.clone(),
                ratio,
                threshold,
                candidates: candidates.len(),
                active,
            });
        }

        let known: HashMap<&str, ListingId> = snapshot
            .entries
            .iter()
            .map(|e| (e.listing_url.as_str(), e.id))
            .collect();

        let mut plan = ReconciliationPlan {
            partition: partition.clone(),
            creates: Vec::new(),
            updates: Vec::new(),
            deactivations: Vec::new(),
            snapshot_active_count: active,
            deactivation_ratio: ratio,
        };
        for listing in listings {
            match known.get(listing.listing_url.as_str()) {
                Some(id) => plan.updates.push(UpdateInstruction {
                    id: *id,
                    partition: partition.clone(),
                    listing: listing.clone(),
                }),
                None => plan.creates.push(CreateInstruction {
                    partition: partition.clone(),
                    listing: listing.clone(),
                }),
            }
        }
        plan.deactivations = candidates
            .into_iter()
            .map(|e| DeactivateInstruction {
                id: e.id,
                listing_url: e.listing_url.clone(),
            })
            .collect();

        info!(
            partition = %partition,
            creates = plan.creates.len(),
            updates = plan.updates.len(),
            deactivations = plan.deactivations.len(),
            ratio,
            "reconciliation plan ready"
        );
        Ok(plan)
    }
}

/// Keeps the first position of each url but the values of its last occurrence.
fn collapse_duplicate_urls(batch: &[NormalizedListing]) -> Vec<&NormalizedListing> {
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<&NormalizedListing> = Vec::with_capacity(batch.len());
    for listing in batch {
        match position.get(listing.listing_url.as_str()) {
            Some(&index) => {
                debug!(listing_url = %listing.listing_url, "duplicate url in batch; newest record wins");
                out[index] = listing;
            }
            None => {
                position.insert(listing.listing_url.as_str(), out.len());
                out.push(listing);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    Create,
    Update,
    Deactivate,
}

impl InstructionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Deactivate => "deactivate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedInstruction {
    pub kind: InstructionKind,
    pub listing_url: String,
    pub id: ListingId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionFailure {
    pub kind: InstructionKind,
    pub listing_url: String,
    pub not_found: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: Vec<AppliedInstruction>,
    pub failures: Vec<InstructionFailure>,
    /// Instruction tasks that panicked or were cancelled.
    pub aborted: usize,
}

impl ApplyReport {
    pub fn count(&self, kind: InstructionKind) -> usize {
        self.applied.iter().filter(|a| a.kind == kind).count()
    }

    /// Listings that were created or updated, in url order.
    pub fn upserted(&self) -> impl Iterator<Item = &AppliedInstruction> + '_ {
        self.applied
            .iter()
            .filter(|a| a.kind != InstructionKind::Deactivate)
    }
}

type InstructionResult = (InstructionKind, String, Result<ListingId, StoreError>);

/// Applies every instruction of an already validated plan. Failures are collected, never fatal.
pub async fn apply_plan(
    store: Arc<dyn ListingStore>,
    plan: &ReconciliationPlan,
    concurrency: usize,
) -> ApplyReport {
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks: JoinSet<InstructionResult> = JoinSet::new();

    let upserts = plan
        .creates
        .iter()
        .map(|c| (InstructionKind::Create, None, c.partition.clone(), c.listing.clone()))
        .chain(plan.updates.iter().map(|u| {
            (
                InstructionKind::Update,
                Some(u.id),
                u.partition.clone(),
                u.listing.clone(),
            )
        }));
    for (kind, expected, partition, listing) in upserts {
        let store = store.clone();
        let limit = limit.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await;
            let result = store.upsert_by_url(&partition, &listing).await;
            if let (Ok(id), Some(expected)) = (&result, expected) {
                if *id != expected {
                    warn!(
                        listing_url = %listing.listing_url,
                        %expected,
                        actual = %id,
                        "update landed on a different listing id"
                    );
                }
            }
            (kind, listing.listing_url, result)
        });
    }

    for deactivation in &plan.deactivations {
        let store = store.clone();
        let limit = limit.clone();
        let DeactivateInstruction { id, listing_url } = deactivation.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await;
            let result = store.set_inactive(id).await.map(|()| id);
            (InstructionKind::Deactivate, listing_url, result)
        });
    }

    let mut report = ApplyReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((kind, listing_url, Ok(id))) => report.applied.push(AppliedInstruction {
                kind,
                listing_url,
                id,
            }),
            Ok((kind, listing_url, Err(err))) => {
                warn!(kind = kind.as_str(), %listing_url, error = %err, "instruction failed");
                report.failures.push(InstructionFailure {
                    kind,
                    listing_url,
                    not_found: matches!(err, StoreError::NotFound(_)),
                    error: err.to_string(),
                });
            }
            Err(err) => {
                error!(error = %err, "instruction task aborted");
                report.aborted += 1;
            }
        }
    }
    report.applied.sort_by(|a, b| a.listing_url.cmp(&b.listing_url));
    report.failures.sort_by(|a, b| a.listing_url.cmp(&b.listing_url));
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use autolist_core::ActiveListing;
    use autolist_storage::InMemoryListingStore;

    fn listing(url: &str) -> NormalizedListing {
        NormalizedListing {
            source_id: "bmw-dealer".into(),
            listing_url: url.into(),
            year: "2024".into(),
            make: Some("BMW".into()),
            model: Some("X3".into()),
            price: None,
            condition: Some("NEW".into()),
            location: None,
            vehicle_type: None,
            transmission: None,
            mileage: None,
            engine: None,
            cylinders: None,
            exterior: None,
            interior: None,
            description: None,
            image_urls: vec![],
            vin: None,
            drive_train: None,
            fuel_type: None,
        }
    }

    fn url(i: usize) -> String {
        format!("https://bmw.example/listing/{i}")
    }

    fn snapshot(partition: &PartitionKey, count: usize) -> ActiveListingSnapshot {
        ActiveListingSnapshot {
            partition: partition.clone(),
            entries: (0..count)
                .map(|i| ActiveListing {
                    id: ListingId::new_v4(),
                    listing_url: url(i),
                    is_active: true,
                })
                .collect(),
        }
    }

    #[test]
    fn small_attrition_produces_a_plan() {
        let partition = PartitionKey::new("bmw-dealer");
        let snap = snapshot(&partition, 10);
        let mut batch: Vec<_> = (0..9).map(|i| listing(&url(i))).collect();
        batch.push(listing(&url(42)));

        let plan = ReconciliationEngine::default()
            .plan(&partition, &batch, &snap)
            .unwrap();
        assert!((plan.deactivation_ratio - 0.1).abs() < 1e-9);
        assert_eq!(plan.updates.len(), 9);
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.deactivations.len(), 1);
        assert_eq!(plan.deactivations[0].listing_url, url(9));
        assert_eq!(plan.creates[0].partition, partition);
    }

    #[test]
    fn mass_disappearance_trips_the_breaker() {
        let partition = PartitionKey::new("bmw-dealer");
        let snap = snapshot(&partition, 10);
        let batch = vec![listing(&url(0))];

        let err = ReconciliationEngine::default()
            .plan(&partition, &batch, &snap)
            .unwrap_err();
        match err {
            ReconcileError::RatioExceeded {
                ratio,
                candidates,
                active,
                ..
            } => {
                assert!((ratio - 0.9).abs() < 1e-9);
                assert_eq!((candidates, active), (9, 10));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ratio_exactly_at_threshold_is_allowed_and_empty_snapshot_is_zero() {
        let partition = PartitionKey::new("bmw-dealer");
        let engine = ReconciliationEngine::new(ReconcileConfig {
            deactivation_threshold: 0.5,
        });
        let snap = snapshot(&partition, 4);
        let batch = vec![listing(&url(0)), listing(&url(1))];
        assert!(engine.plan(&partition, &batch, &snap).is_ok());

        let fresh = engine
            .plan(&partition, &batch, &ActiveListingSnapshot::empty(partition.clone()))
            .unwrap();
        assert_eq!(fresh.deactivation_ratio, 0.0);
        assert_eq!(fresh.creates.len(), 2);
    }

    #[test]
    fn duplicate_urls_collapse_to_the_newest_record() {
        let partition = PartitionKey::new("bmw-dealer");
        let mut newer = listing(&url(1));
        newer.price = Some("$51,000".into());
        let batch = vec![listing(&url(1)), listing(&url(2)), newer];

        let plan = ReconciliationEngine::default()
            .plan(&partition, &batch, &ActiveListingSnapshot::empty(partition.clone()))
            .unwrap();
        assert_eq!(plan.creates.len(), 2);
        assert_eq!(plan.creates[0].listing.price.as_deref(), Some("$51,000"));
    }

    #[test]
    fn mismatched_snapshot_and_bad_threshold_are_configuration_errors() {
        let partition = PartitionKey::new("bmw-dealer");
        let other = snapshot(&PartitionKey::new("audi-dealer"), 1);
        let err = ReconciliationEngine::default()
            .plan(&partition, &[], &other)
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Configuration(ConfigurationError::SnapshotPartitionMismatch { .. })
        ));

        let bad = ReconciliationEngine::new(ReconcileConfig {
            deactivation_threshold: 1.5,
        });
        assert!(matches!(
            bad.plan(&partition, &[], &ActiveListingSnapshot::empty(partition.clone())),
            Err(ReconcileError::Configuration(ConfigurationError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn apply_collects_not_found_without_aborting() {
        let store = Arc::new(InMemoryListingStore::new());
        let partition = PartitionKey::new("bmw-dealer");
        let existing = store
            .upsert_by_url(&partition, &listing(&url(1)))
            .await
            .unwrap();

        let plan = ReconciliationPlan {
            partition: partition.clone(),
            creates: vec![CreateInstruction {
                partition: partition.clone(),
                listing: listing(&url(2)),
            }],
            updates: vec![UpdateInstruction {
                id: existing,
                partition: partition.clone(),
                listing: listing(&url(1)),
            }],
            deactivations: vec![DeactivateInstruction {
                id: ListingId::new_v4(),
                listing_url: url(3),
            }],
            snapshot_active_count: 1,
            deactivation_ratio: 0.0,
        };

        let report = apply_plan(store.clone(), &plan, 2).await;
        assert_eq!(report.count(InstructionKind::Create), 1);
        assert_eq!(report.count(InstructionKind::Update), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].not_found);
        assert_eq!(report.upserted().count(), 2);
        assert_eq!(
            store.fetch_active_partition(&partition).await.unwrap().active_count(),
            2
        );
    }
}
