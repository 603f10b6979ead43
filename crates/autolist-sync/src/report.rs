//! Per-run reports: markdown brief, delta JSON and parquet snapshots with a hashed manifest.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use autolist_core::NormalizedListing;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::pipeline::RunSummary;
use crate::reconcile::InstructionKind;

pub const DELTA_FILE: &str = "reconciliation_delta.json";
pub const BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `daily_brief.md` and the delta JSON into `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let (creates, updates, deactivations, ratio) = match &summary.plan {
        Some(plan) => (
            plan.creates.len(),
            plan.updates.len(),
            plan.deactivations.len(),
            plan.deactivation_ratio,
        ),
        None => (0, 0, 0, 0.0),
    };
    let partition = summary
        .plan
        .as_ref()
        .map(|p| p.partition.to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut category_counts: Vec<(String, usize)> = Vec::new();
    for listing in &summary.features {
        for (category, spans) in listing.grouped_features.iter() {
            if spans.is_empty() {
                continue;
            }
            match category_counts.iter_mut().find(|(c, _)| c == category.as_str()) {
                Some((_, n)) => *n += spans.len(),
                None => category_counts.push((category.as_str().to_string(), spans.len())),
            }
        }
    }

    let brief = format!(
        "# Autolist Daily Brief\n\n- Run ID: `{}`\n- Source: {}\n- Job: {}\n- Outcome: {}\n- Started: {}\n- Finished: {}\n- Partition: {}\n- Records received: {}\n- Records dropped: {}\n- Malformed lines skipped: {}\n- Listings without images: {}\n\n## Reconciliation\n- Creates: {}\n- Updates: {}\n- Deactivations: {}\n- Deactivation ratio: {:.3}\n- Apply failures: {}\n\n## Feature Spans\n{}\n",
        summary.run_id,
        summary.source_id,
        summary.job_id,
        summary.outcome.as_str(),
        summary.started_at,
        summary.finished_at,
        partition,
        summary.records_received,
        summary.mapping_errors.len(),
        summary.line_errors.len(),
        summary.listings_without_images,
        creates,
        updates,
        deactivations,
        ratio,
        summary.apply.failures.len(),
        if category_counts.is_empty() {
            "- none".to_string()
        } else {
            category_counts
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
    );
    fs::write(reports_dir.join(BRIEF_FILE), brief)
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": {
            "run_id": summary.run_id,
            "source_id": summary.source_id,
            "job_id": summary.job_id,
            "outcome": summary.outcome,
            "started_at": summary.started_at,
            "finished_at": summary.finished_at,
            "records_received": summary.records_received,
        },
        "line_errors": summary.line_errors,
        "mapping_errors": summary.mapping_errors,
        "plan": summary.plan,
        "apply": summary.apply,
        "features": summary.features,
        "feature_failures": summary.feature_failures,
    }))
    .context("serializing reconciliation delta")?;
    fs::write(reports_dir.join(DELTA_FILE), delta_json)
        .await
        .with_context(|| format!("writing {DELTA_FILE}"))?;

    Ok(reports_dir)
}

/// Writes listing, instruction and feature snapshots plus `manifest.json` under `snapshots/`.
pub async fn export_parquet_snapshots(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    let instructions_path = snapshot_dir.join("instructions.parquet");
    let features_path = snapshot_dir.join("features.parquet");

    let listing_rows = write_listings_parquet(&listings_path, summary)?;
    let instruction_rows = write_instructions_parquet(&instructions_path, summary)?;
    let feature_rows = write_features_parquet(&features_path, summary)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id: summary.run_id.to_string(),
        files: vec![
            manifest_entry("listings", reports_dir, &listings_path, listing_rows)?,
            manifest_entry("instructions", reports_dir, &instructions_path, instruction_rows)?,
            manifest_entry("features", reports_dir, &features_path, feature_rows)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, summary: &RunSummary) -> Result<usize> {
    let mut rows: Vec<(&'static str, &NormalizedListing)> = Vec::new();
    if let Some(plan) = &summary.plan {
        rows.extend(plan.creates.iter().map(|c| ("create", &c.listing)));
        rows.extend(plan.updates.iter().map(|u| ("update", &u.listing)));
    }
    let ids: HashMap<&str, String> = summary
        .apply
        .upserted()
        .map(|a| (a.listing_url.as_str(), a.id.to_string()))
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_url", DataType::Utf8, false),
        ArrowField::new("listing_id", DataType::Utf8, true),
        ArrowField::new("instruction", DataType::Utf8, false),
        ArrowField::new("make", DataType::Utf8, true),
        ArrowField::new("model", DataType::Utf8, true),
        ArrowField::new("year", DataType::Utf8, false),
        ArrowField::new("condition", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("price", DataType::Utf8, true),
        ArrowField::new("image_count", DataType::UInt32, false),
        ArrowField::new("has_description", DataType::Boolean, false),
    ]));

    let urls = StringArray::from(
        rows.iter()
            .map(|(_, l)| Some(l.listing_url.as_str()))
            .collect::<Vec<_>>(),
    );
    let listing_ids = StringArray::from(
        rows.iter()
            .map(|(_, l)| ids.get(l.listing_url.as_str()).map(String::as_str))
            .collect::<Vec<_>>(),
    );
    let instructions = StringArray::from(rows.iter().map(|(k, _)| Some(*k)).collect::<Vec<_>>());
    let makes = StringArray::from(rows.iter().map(|(_, l)| l.make.as_deref()).collect::<Vec<_>>());
    let models = StringArray::from(rows.iter().map(|(_, l)| l.model.as_deref()).collect::<Vec<_>>());
    let years = StringArray::from(
        rows.iter()
            .map(|(_, l)| Some(l.year.as_str()))
            .collect::<Vec<_>>(),
    );
    let conditions = StringArray::from(
        rows.iter()
            .map(|(_, l)| l.condition.as_deref())
            .collect::<Vec<_>>(),
    );
    let locations = StringArray::from(
        rows.iter()
            .map(|(_, l)| l.location.as_deref())
            .collect::<Vec<_>>(),
    );
    let prices = StringArray::from(rows.iter().map(|(_, l)| l.price.as_deref()).collect::<Vec<_>>());
    let image_counts = UInt32Array::from(
        rows.iter()
            .map(|(_, l)| l.image_urls.len() as u32)
            .collect::<Vec<_>>(),
    );
    let has_description = BooleanArray::from(
        rows.iter()
            .map(|(_, l)| l.description.is_some())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(urls),
            Arc::new(listing_ids),
            Arc::new(instructions),
            Arc::new(makes),
            Arc::new(models),
            Arc::new(years),
            Arc::new(conditions),
            Arc::new(locations),
            Arc::new(prices),
            Arc::new(image_counts),
            Arc::new(has_description),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn write_instructions_parquet(path: &Path, summary: &RunSummary) -> Result<usize> {
    let mut rows: Vec<(InstructionKind, &str, Option<String>, &'static str, Option<&str>)> = summary
        .apply
        .applied
        .iter()
        .map(|a| (a.kind, a.listing_url.as_str(), Some(a.id.to_string()), "applied", None))
        .collect();
    rows.extend(summary.apply.failures.iter().map(|f| {
        (
            f.kind,
            f.listing_url.as_str(),
            None,
            if f.not_found { "not_found" } else { "failed" },
            Some(f.error.as_str()),
        )
    }));

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("listing_url", DataType::Utf8, false),
        ArrowField::new("listing_id", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("error", DataType::Utf8, true),
    ]));
    let kinds = StringArray::from(rows.iter().map(|r| Some(r.0.as_str())).collect::<Vec<_>>());
    let urls = StringArray::from(rows.iter().map(|r| Some(r.1)).collect::<Vec<_>>());
    let ids = StringArray::from(rows.iter().map(|r| r.2.as_deref()).collect::<Vec<_>>());
    let statuses = StringArray::from(rows.iter().map(|r| Some(r.3)).collect::<Vec<_>>());
    let errors = StringArray::from(rows.iter().map(|r| r.4).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(kinds),
            Arc::new(urls),
            Arc::new(ids),
            Arc::new(statuses),
            Arc::new(errors),
        ],
    )
    .context("building instructions record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn write_features_parquet(path: &Path, summary: &RunSummary) -> Result<usize> {
    let rows = summary
        .features
        .iter()
        .flat_map(|listing| {
            listing.grouped_features.iter().flat_map(move |(category, spans)| {
                spans.iter().map(move |span| {
                    (
                        listing.listing_url.as_str(),
                        listing.listing_id.to_string(),
                        category.as_str(),
                        span.as_str(),
                    )
                })
            })
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_url", DataType::Utf8, false),
        ArrowField::new("listing_id", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("span", DataType::Utf8, false),
    ]));
    let urls = StringArray::from(rows.iter().map(|r| Some(r.0)).collect::<Vec<_>>());
    let ids = StringArray::from(rows.iter().map(|r| Some(r.1.as_str())).collect::<Vec<_>>());
    let categories = StringArray::from(rows.iter().map(|r| Some(r.2)).collect::<Vec<_>>());
    let spans = StringArray::from(rows.iter().map(|r| Some(r.3)).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(urls),
            Arc::new(ids),
            Arc::new(categories),
            Arc::new(spans),
        ],
    )
    .context("building features record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown summary of the newest `runs` report directories under `reports_root`.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(DELTA_FILE).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Autolist Run Report".to_string(), String::new()];
    if dirs.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join(DELTA_FILE);
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let run = &delta["run"];
        let plan_len = |key: &str| {
            delta["plan"][key]
                .as_array()
                .map(|a| a.len())
                .unwrap_or(0)
        };
        let failures = delta["apply"]["failures"]
            .as_array()
            .map(|a| a.len())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- source: {} (job {})",
            run["source_id"].as_str().unwrap_or("unknown"),
            run["job_id"].as_str().unwrap_or("unknown")
        ));
        lines.push(format!("- outcome: {}", run["outcome"].as_str().unwrap_or("unknown")));
        lines.push(format!(
            "- creates: {}, updates: {}, deactivations: {}, failures: {}",
            plan_len("creates"),
            plan_len("updates"),
            plan_len("deactivations"),
            failures
        ));
        if let Some(ratio) = delta["plan"]["deactivation_ratio"].as_f64() {
            lines.push(format!("- deactivation ratio: {ratio:.3}"));
        }
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
