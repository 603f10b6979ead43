//! Core domain model for autolist: scraped records, canonical listings,
//! reconciliation plans and the feature taxonomy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "autolist-core";

/// Raw record as delivered by the scraper. Every field is optional and kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrapedRecord {
    #[serde(default, deserialize_with = "opaque_string")]
    pub make: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub condition: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub location: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "opaque_string")]
    pub vehicle_type: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub transmission: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub mileage: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub engine: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub cylinders: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub exterior: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub interior: Option<String>,
    #[serde(alias = "url", default, deserialize_with = "opaque_string")]
    pub listing_url: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub description: Option<String>,
    /// `|`-delimited image url list.
    #[serde(alias = "images", default, deserialize_with = "opaque_string")]
    pub image_urls: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub vin: Option<String>,
    #[serde(alias = "drivetrain", default, deserialize_with = "opaque_string")]
    pub drive_train: Option<String>,
    #[serde(default, deserialize_with = "opaque_string")]
    pub fuel_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OpaqueValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Accepts strings, numbers and booleans as text; `null` and blank strings become `None`.
fn opaque_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<OpaqueValue>::deserialize(deserializer)?;
    let text = match value {
        None => return Ok(None),
        Some(OpaqueValue::Text(s)) => s,
        Some(OpaqueValue::Int(n)) => n.to_string(),
        Some(OpaqueValue::Float(f)) => f.to_string(),
        Some(OpaqueValue::Bool(b)) => b.to_string(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

/// Canonical listing produced by the normalizer. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub source_id: String,
    pub listing_url: String,
    pub year: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub price: Option<String>,
    pub condition: Option<String>,
    pub location: Option<String>,
    pub vehicle_type: Option<String>,
    pub transmission: Option<String>,
    pub mileage: Option<String>,
    pub engine: Option<String>,
    pub cylinders: Option<String>,
    pub exterior: Option<String>,
    pub interior: Option<String>,
    pub description: Option<String>,
    pub image_urls: Vec<String>,
    pub vin: Option<String>,
    pub drive_train: Option<String>,
    pub fuel_type: Option<String>,
}

impl NormalizedListing {
    pub fn has_images(&self) -> bool {
        !self.image_urls.is_empty()
    }
}

/// Scope within which active-listing reconciliation happens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned listing identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub Uuid);

impl ListingId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("partition strategy `{strategy}` needs `{field}` on the first record, but it is missing")]
    MissingPartitionField {
        strategy: &'static str,
        field: &'static str,
    },
    #[error("partition strategy `{strategy}` cannot scope a batch without records")]
    NoRecordToScope { strategy: &'static str },
    #[error("snapshot partition `{snapshot}` does not match requested partition `{requested}`")]
    SnapshotPartitionMismatch { requested: String, snapshot: String },
    #[error("{0}")]
    Invalid(String),
}

/// How a source derives the partition key its batches reconcile against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    #[default]
    Source,
    Make,
    ConditionLocation,
}

impl PartitionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Make => "make",
            Self::ConditionLocation => "condition_location",
        }
    }

    pub fn resolve(
        self,
        source_id: &str,
        first: Option<&NormalizedListing>,
    ) -> Result<PartitionKey, ConfigurationError> {
        match self {
            Self::Source => Ok(PartitionKey::new(source_id)),
            Self::Make => {
                let first = first.ok_or(ConfigurationError::NoRecordToScope {
                    strategy: self.as_str(),
                })?;
                let make = first.make.as_deref().ok_or(ConfigurationError::MissingPartitionField {
                    strategy: self.as_str(),
                    field: "make",
                })?;
                Ok(PartitionKey::new(make))
            }
            Self::ConditionLocation => {
                let first = first.ok_or(ConfigurationError::NoRecordToScope {
                    strategy: self.as_str(),
                })?;
                let condition =
                    first
                        .condition
                        .as_deref()
                        .ok_or(ConfigurationError::MissingPartitionField {
                            strategy: self.as_str(),
                            field: "condition",
                        })?;
                let location =
                    first
                        .location
                        .as_deref()
                        .ok_or(ConfigurationError::MissingPartitionField {
                            strategy: self.as_str(),
                            field: "location",
                        })?;
                Ok(PartitionKey::new(format!("{condition}:{location}")))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveListing {
    pub id: ListingId,
    pub listing_url: String,
    pub is_active: bool,
}

/// The store's view of one partition, fetched fresh for each reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveListingSnapshot {
    pub partition: PartitionKey,
    pub entries: Vec<ActiveListing>,
}

impl ActiveListingSnapshot {
    pub fn empty(partition: PartitionKey) -> Self {
        Self {
            partition,
            entries: Vec::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_active).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstruction {
    pub partition: PartitionKey,
    pub listing: NormalizedListing,
}

/// Overwrites an existing listing; applying it always reactivates the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInstruction {
    pub id: ListingId,
    pub partition: PartitionKey,
    pub listing: NormalizedListing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateInstruction {
    pub id: ListingId,
    pub listing_url: String,
}

/// Output of reconciliation: three disjoint instruction lists for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub partition: PartitionKey,
    pub creates: Vec<CreateInstruction>,
    pub updates: Vec<UpdateInstruction>,
    pub deactivations: Vec<DeactivateInstruction>,
    pub snapshot_active_count: usize,
    pub deactivation_ratio: f64,
}

impl ReconciliationPlan {
    pub fn instruction_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deactivations.len()
    }
}

/// Closed display taxonomy for extracted description features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    Performance,
    Safety,
    Comfort,
    Technology,
    Exterior,
    InteriorTrim,
    Economy,
    Drivetrain,
    Certification,
}

impl FeatureCategory {
    pub const ALL: [FeatureCategory; 9] = [
        Self::Performance,
        Self::Safety,
        Self::Comfort,
        Self::Technology,
        Self::Exterior,
        Self::InteriorTrim,
        Self::Economy,
        Self::Drivetrain,
        Self::Certification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Safety => "safety",
            Self::Comfort => "comfort",
            Self::Technology => "technology",
            Self::Exterior => "exterior",
            Self::InteriorTrim => "interior_trim",
            Self::Economy => "economy",
            Self::Drivetrain => "drivetrain",
            Self::Certification => "certification",
        }
    }

    /// Matcher entity type → display category. Anything else is unmapped.
    pub fn from_entity_type(entity_type: &str) -> Option<Self> {
        match entity_type {
            "performance_feature" => Some(Self::Performance),
            "safety_feature" => Some(Self::Safety),
            "comfort_feature" => Some(Self::Comfort),
            "technology_feature" => Some(Self::Technology),
            "exterior_feature" => Some(Self::Exterior),
            "interior_trim_feature" => Some(Self::InteriorTrim),
            "economy" => Some(Self::Economy),
            "drivetrain" => Some(Self::Drivetrain),
            "certification" => Some(Self::Certification),
            _ => None,
        }
    }

    pub fn intent_label(self) -> String {
        format!("feature.{}", self.as_str())
    }
}

impl fmt::Display for FeatureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matched description spans per category. All nine categories are always present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupedFeatures {
    pub performance: Vec<String>,
    pub safety: Vec<String>,
    pub comfort: Vec<String>,
    pub technology: Vec<String>,
    pub exterior: Vec<String>,
    pub interior_trim: Vec<String>,
    pub economy: Vec<String>,
    pub drivetrain: Vec<String>,
    pub certification: Vec<String>,
}

impl GroupedFeatures {
    pub fn get(&self, category: FeatureCategory) -> &[String] {
        match category {
            FeatureCategory::Performance => &self.performance,
            FeatureCategory::Safety => &self.safety,
            FeatureCategory::Comfort => &self.comfort,
            FeatureCategory::Technology => &self.technology,
            FeatureCategory::Exterior => &self.exterior,
            FeatureCategory::InteriorTrim => &self.interior_trim,
            FeatureCategory::Economy => &self.economy,
            FeatureCategory::Drivetrain => &self.drivetrain,
            FeatureCategory::Certification => &self.certification,
        }
    }

    fn get_mut(&mut self, category: FeatureCategory) -> &mut Vec<String> {
        match category {
            FeatureCategory::Performance => &mut self.performance,
            FeatureCategory::Safety => &mut self.safety,
            FeatureCategory::Comfort => &mut self.comfort,
            FeatureCategory::Technology => &mut self.technology,
            FeatureCategory::Exterior => &mut self.exterior,
            FeatureCategory::InteriorTrim => &mut self.interior_trim,
            FeatureCategory::Economy => &mut self.economy,
            FeatureCategory::Drivetrain => &mut self.drivetrain,
            FeatureCategory::Certification => &mut self.certification,
        }
    }

    /// Appends `span` unless the category already holds an identical string.
    pub fn push_unique(&mut self, category: FeatureCategory, span: &str) -> bool {
        let list = self.get_mut(category);
        if list.iter().any(|existing| existing == span) {
            return false;
        }
        list.push(span.to_string());
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureCategory, &[String])> + '_ {
        FeatureCategory::ALL.into_iter().map(move |c| (c, self.get(c)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, spans)| spans.is_empty())
    }

    pub fn total_spans(&self) -> usize {
        self.iter().map(|(_, spans)| spans.len()).sum()
    }
}

/// Listing as held by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: ListingId,
    pub partition: PartitionKey,
    pub listing: NormalizedListing,
    pub is_active: bool,
    pub grouped_features: Option<GroupedFeatures>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(condition: Option<&str>, location: Option<&str>, make: Option<&str>) -> NormalizedListing {
        NormalizedListing {
            source_id: "mazda-dealer".into(),
            listing_url: "https://dealer.example/cx5".into(),
            year: "2024".into(),
            make: make.map(Into::into),
            model: Some("CX-5".into()),
            price: None,
            condition: condition.map(Into::into),
            location: location.map(Into::into),
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

    #[test]
    fn scraped_record_accepts_numbers_and_aliases() {
        let record: ScrapedRecord = serde_json::from_str(
            r#"{"url":"https://x.example/1","year":2024,"price":31999.5,"make":"  ","type":"suv","drivetrain":"AWD","web-scraper-order":"1-2"}"#,
        )
        .unwrap();
        assert_eq!(record.listing_url.as_deref(), Some("https://x.example/1"));
        assert_eq!(record.year.as_deref(), Some("2024"));
        assert_eq!(record.price.as_deref(), Some("31999.5"));
        assert_eq!(record.make, None);
        assert_eq!(record.vehicle_type.as_deref(), Some("suv"));
        assert_eq!(record.drive_train.as_deref(), Some("AWD"));
    }

    #[test]
    fn grouped_features_serialize_all_nine_keys() {
        let value = serde_json::to_value(GroupedFeatures::default()).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 9);
        for category in FeatureCategory::ALL {
            assert!(keys.contains(&category.as_str().to_string()), "{category} missing");
        }
    }

    #[test]
    fn push_unique_is_case_sensitive_exact_dedup() {
        let mut grouped = GroupedFeatures::default();
        assert!(grouped.push_unique(FeatureCategory::Comfort, "heated seats"));
        assert!(!grouped.push_unique(FeatureCategory::Comfort, "heated seats"));
        assert!(grouped.push_unique(FeatureCategory::Comfort, "Heated seats"));
        assert_eq!(grouped.comfort.len(), 2);
        assert_eq!(grouped.total_spans(), 2);
    }

    #[test]
    fn entity_type_table_covers_every_category() {
        let types = [
            "performance_feature",
            "safety_feature",
            "comfort_feature",
            "technology_feature",
            "exterior_feature",
            "interior_trim_feature",
            "economy",
            "drivetrain",
            "certification",
        ];
        let mapped: Vec<_> = types
            .iter()
            .filter_map(|t| FeatureCategory::from_entity_type(t))
            .collect();
        assert_eq!(mapped, FeatureCategory::ALL.to_vec());
        assert_eq!(FeatureCategory::from_entity_type("economy_feature"), None);
    }

    #[test]
    fn partition_strategies_resolve_or_report_missing_scope() {
        let first = listing(Some("NEW"), None, Some("MAZDA"));
        assert_eq!(
            PartitionStrategy::Source.resolve("mazda-dealer", None).unwrap(),
            PartitionKey::new("mazda-dealer")
        );
        assert_eq!(
            PartitionStrategy::Make.resolve("mazda-dealer", Some(&first)).unwrap(),
            PartitionKey::new("MAZDA")
        );
        assert_eq!(
            PartitionStrategy::ConditionLocation.resolve("mazda-dealer", Some(&first)),
            Err(ConfigurationError::MissingPartitionField {
                strategy: "condition_location",
                field: "location",
            })
        );
        assert!(matches!(
            PartitionStrategy::Make.resolve("mazda-dealer", None),
            Err(ConfigurationError::NoRecordToScope { .. })
        ));
    }
}
