use autolist_core::{NormalizedListing, ScrapedRecord};
use chrono::{Datelike, Utc};
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PLACEHOLDER_MARKERS: [&str; 2] = ["notfound.jpg", "photo_unavailable_640.png"];

const USED: &str = "USED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeHint {
    pub needle: String,
    pub make: String,
}

/// Per-source cleanup knobs, declared alongside the source in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceProfile {
    pub make_hints: Vec<MakeHint>,
    pub image_base_url: Option<String>,
    pub placeholder_image_markers: Vec<String>,
}

impl Default for SourceProfile {
    fn default() -> Self {
        Self {
            make_hints: Vec::new(),
            image_base_url: None,
            placeholder_image_markers: DEFAULT_PLACEHOLDER_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RecordMappingError {
    #[error("record {index} has no listing_url")]
    MissingListingUrl { index: usize },
    #[error("record {index} ({listing_url}) has no year")]
    MissingYear { index: usize, listing_url: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub listings: Vec<NormalizedListing>,
    pub mapping_errors: Vec<RecordMappingError>,
}

impl NormalizedBatch {
    pub fn without_images(&self) -> impl Iterator<Item = &NormalizedListing> + '_ {
        self.listings.iter().filter(|l| !l.has_images())
    }
}

/// Maps scraped records onto canonical listings. Pure for a fixed `current_year`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    current_year: i32,
}

impl Normalizer {
    pub fn new(current_year: i32) -> Self {
        Self { current_year }
    }

    pub fn for_today() -> Self {
        Self::new(Utc::now().year())
    }

    pub fn normalize_batch(
        &self,
        source_id: &str,
        profile: &SourceProfile,
        records: &[ScrapedRecord],
    ) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (index, record) in records.iter().enumerate() {
            match self.normalize(source_id, profile, index, record) {
                Ok(listing) => batch.listings.push(listing),
                Err(err) => batch.mapping_errors.push(err),
            }
        }
        batch
    }

    pub fn normalize(
        &self,
        source_id: &str,
        profile: &SourceProfile,
        index: usize,
        record: &ScrapedRecord,
    ) -> Result<NormalizedListing, RecordMappingError> {
        let listing_url = record
            .listing_url
            .clone()
            .ok_or(RecordMappingError::MissingListingUrl { index })?;
        let year = record
            .year
            .clone()
            .ok_or_else(|| RecordMappingError::MissingYear {
                index,
                listing_url: listing_url.clone(),
            })?;

        let make = upper(&record.make).or_else(|| infer_make(&profile.make_hints, &listing_url));
        let condition = if self.is_recent(&year) {
            upper(&record.condition)
        } else {
            Some(USED.to_string())
        };

        Ok(NormalizedListing {
            source_id: source_id.to_string(),
            image_urls: clean_image_urls(record.image_urls.as_deref(), profile),
            description: record.description.as_deref().and_then(clean_description),
            listing_url,
            year,
            make,
            model: record.model.clone(),
            price: record.price.clone(),
            condition,
            location: upper(&record.location),
            vehicle_type: upper(&record.vehicle_type),
            transmission: record.transmission.clone(),
            mileage: record.mileage.clone(),
            engine: record.engine.clone(),
            cylinders: record.cylinders.clone(),
            exterior: record.exterior.clone(),
            interior: record.interior.clone(),
            vin: record.vin.clone(),
            drive_train: record.drive_train.clone(),
            fuel_type: record.fuel_type.clone(),
        })
    }

    fn is_recent(&self, year: &str) -> bool {
        year.trim()
            .parse::<i32>()
            .map(|y| (self.current_year - y).abs() <= 1)
            .unwrap_or(false)
    }
}

fn upper(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_uppercase)
}

fn infer_make(hints: &[MakeHint], listing_url: &str) -> Option<String> {
    let url = listing_url.to_ascii_lowercase();
    hints
        .iter()
        .find(|hint| url.contains(&hint.needle.to_ascii_lowercase()))
        .map(|hint| hint.make.trim().to_uppercase())
}

fn clean_image_urls(raw: Option<&str>, profile: &SourceProfile) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split('|')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| match (&profile.image_base_url, url.starts_with('/')) {
            (Some(base), true) => format!("{}{}", base.trim_end_matches('/'), url),
            _ => url.to_string(),
        })
        .filter(|url| url.starts_with("https://"))
        .filter(|url| {
            !profile
                .placeholder_image_markers
                .iter()
                .any(|marker| url.contains(marker.as_str()))
        })
        .collect()
}

fn clean_description(raw: &str) -> Option<String> {
    let text = if raw.contains('<') && raw.contains('>') {
        Html::parse_fragment(raw)
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        raw.to_string()
    };
    let folded = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if folded.is_empty() {
        None
    } else {
        Some(folded)
    }
}
