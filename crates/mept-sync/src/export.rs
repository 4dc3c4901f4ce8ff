//! Parquet snapshots of one cycle plus a sha256 manifest.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use mept_core::{ChangeKind, ChangeRecord, Listing, MatchCluster};
use parquet::arrow::ArrowWriter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cycle::CycleOutcome;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

fn price(value: Decimal) -> Option<f64> {
    value.to_f64()
}

fn strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn write_parquet(path: &Path, columns: Vec<(ArrowField, ArrayRef)>) -> Result<()> {
    let (fields, arrays): (Vec<_>, Vec<_>) = columns.into_iter().unzip();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .with_context(|| format!("building record batch for {}", path.display()))?;
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

pub fn write_listings_parquet(path: &Path, listings: &[Listing]) -> Result<()> {
    let observed: Vec<String> = listings.iter().map(|l| l.observed_at.to_rfc3339()).collect();
    let categories: Vec<&str> = listings.iter().map(|l| l.category.label()).collect();
    write_parquet(
        path,
        vec![
            (
                ArrowField::new("id", DataType::Utf8, false),
                strings(listings.iter().map(|l| Some(l.id.as_str()))),
            ),
            (
                ArrowField::new("store", DataType::Utf8, false),
                strings(listings.iter().map(|l| Some(l.store.as_str()))),
            ),
            (
                ArrowField::new("name", DataType::Utf8, false),
                strings(listings.iter().map(|l| Some(l.raw_name.as_str()))),
            ),
            (
                ArrowField::new("canonical_name", DataType::Utf8, false),
                strings(listings.iter().map(|l| Some(l.canonical_name.as_str()))),
            ),
            (
                ArrowField::new("category", DataType::Utf8, false),
                strings(categories.iter().map(|c| Some(*c))),
            ),
            (
                ArrowField::new("model_key", DataType::Utf8, true),
                strings(listings.iter().map(|l| l.spec.model_key())),
            ),
            (
                ArrowField::new("storage_gb", DataType::UInt32, true),
                Arc::new(UInt32Array::from(
                    listings.iter().map(|l| l.spec.storage_gb).collect::<Vec<_>>(),
                )),
            ),
            (
                ArrowField::new("price", DataType::Float64, true),
                Arc::new(Float64Array::from(
                    listings.iter().map(|l| price(l.price)).collect::<Vec<_>>(),
                )),
            ),
            (
                ArrowField::new("price_text", DataType::Utf8, false),
                strings(listings.iter().map(|l| Some(l.price_text.as_str()))),
            ),
            (
                ArrowField::new("url", DataType::Utf8, true),
                strings(listings.iter().map(|l| l.url.as_deref())),
            ),
            (
                ArrowField::new("observed_at", DataType::Utf8, false),
                strings(observed.iter().map(|s| Some(s.as_str()))),
            ),
        ],
    )
}

/// One row per cluster member; `rank` 0 is the cheapest offer.
pub fn write_clusters_parquet(path: &Path, clusters: &[MatchCluster]) -> Result<()> {
    let rows: Vec<(&MatchCluster, u32, &Listing)> = clusters
        .iter()
        .flat_map(|c| {
            c.listings
                .iter()
                .zip(0u32..)
                .map(move |(l, rank)| (c, rank, l))
        })
        .collect();
    write_parquet(
        path,
        vec![
            (
                ArrowField::new("match_key", DataType::Utf8, false),
                strings(rows.iter().map(|(c, _, _)| Some(c.match_key.as_str()))),
            ),
            (
                ArrowField::new("rank", DataType::UInt32, false),
                Arc::new(UInt32Array::from(
                    rows.iter().map(|(_, r, _)| *r).collect::<Vec<_>>(),
                )),
            ),
            (
                ArrowField::new("listing_id", DataType::Utf8, false),
                strings(rows.iter().map(|(_, _, l)| Some(l.id.as_str()))),
            ),
            (
                ArrowField::new("store", DataType::Utf8, false),
                strings(rows.iter().map(|(_, _, l)| Some(l.store.as_str()))),
            ),
            (
                ArrowField::new("price", DataType::Float64, true),
                Arc::new(Float64Array::from(
                    rows.iter().map(|(_, _, l)| price(l.price)).collect::<Vec<_>>(),
                )),
            ),
            (
                ArrowField::new("confidence", DataType::Float64, false),
                Arc::new(Float64Array::from(
                    rows.iter().map(|(c, _, _)| c.confidence).collect::<Vec<_>>(),
                )),
            ),
            (
                ArrowField::new("review_required", DataType::Boolean, false),
                Arc::new(BooleanArray::from(
                    rows.iter().map(|(c, _, _)| c.review_required).collect::<Vec<_>>(),
                )),
            ),
        ],
    )
}

/// Every non-unchanged record.
pub fn write_changes_parquet(path: &Path, changes: &[ChangeRecord]) -> Result<()> {
    let rows: Vec<&ChangeRecord> = changes
        .iter()
        .filter(|c| c.kind != ChangeKind::Unchanged)
        .collect();
    write_parquet(
        path,
        vec![
            (
                ArrowField::new("kind", DataType::Utf8, false),
                strings(rows.iter().map(|c| Some(c.kind.as_str()))),
            ),
            (
                ArrowField::new("id", DataType::Utf8, false),
                strings(rows.iter().map(|c| Some(c.id.as_str()))),
            ),
            (
                ArrowField::new("store", DataType::Utf8, false),
                strings(rows.iter().map(|c| Some(c.listing.store.as_str()))),
            ),
            (
                ArrowField::new("old_price", DataType::Float64, true),
                Arc::new(Float64Array::from(
                    rows.iter().map(|c| c.old_price.and_then(price)).collect::<Vec<_>>(),
                )),
            ),
            (
                ArrowField::new("new_price", DataType::Float64, true),
                Arc::new(Float64Array::from(
                    rows.iter().map(|c| c.new_price.and_then(price)).collect::<Vec<_>>(),
                )),
            ),
            (
                ArrowField::new("delta", DataType::Float64, true),
                Arc::new(Float64Array::from(
                    rows.iter().map(|c| c.delta.and_then(price)).collect::<Vec<_>>(),
                )),
            ),
        ],
    )
}

fn manifest_entry(name: &str, root: &Path, path: &Path, rows: usize) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: path.strip_prefix(root).unwrap_or(path).display().to_string(),
        rows,
        sha256: hex::encode(Sha256::digest(&bytes)),
        bytes: bytes.len() as u64,
    })
}

/// Write `snapshots/{listings,clusters,changes}.parquet` under `reports_dir`
/// and return the manifest path.
pub fn export_snapshots(reports_dir: &Path, outcome: &CycleOutcome) -> Result<std::path::PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    let clusters_path = snapshot_dir.join("clusters.parquet");
    let changes_path = snapshot_dir.join("changes.parquet");

    write_listings_parquet(&listings_path, &outcome.state.products)?;
    write_clusters_parquet(&clusters_path, &outcome.clusters)?;
    write_changes_parquet(&changes_path, &outcome.changes)?;

    let cluster_rows = outcome.clusters.iter().map(|c| c.listings.len()).sum();
    let change_rows = outcome
        .changes
        .iter()
        .filter(|c| c.kind != ChangeKind::Unchanged)
        .count();
    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        files: vec![
            manifest_entry("listings", reports_dir, &listings_path, outcome.state.products.len())?,
            manifest_entry("clusters", reports_dir, &clusters_path, cluster_rows)?,
            manifest_entry("changes", reports_dir, &changes_path, change_rows)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mept_core::{EngineConfig, PreviousState, RawListing};
    use tempfile::tempdir;

    use crate::cycle::run_cycle;

    fn raw(store: &str, name: &str, price: &str) -> RawListing {
        RawListing {
            store_name: Some(store.into()),
            raw_name: Some(name.into()),
            raw_price_text: Some(price.into()),
            url: None,
            image_url: None,
        }
    }

    #[test]
    fn manifest_lists_every_snapshot_with_row_counts() {
        let outcome = run_cycle(
            PreviousState::FirstRun,
            &[
                raw("Scan", "iPhone 15 128GB", "€999.00"),
                raw("Klikk", "Apple iPhone 15 128GB", "€1,050"),
                raw("Klikk", "Galaxy Buds FE", "€79.00"),
            ],
            &EngineConfig::default(),
            Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        );
        let dir = tempdir().expect("tempdir");
        let manifest_path = export_snapshots(dir.path(), &outcome).expect("export");

        let manifest: SnapshotManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("parse");
        assert_eq!(manifest.schema_version, SNAPSHOT_SCHEMA_VERSION);
        let summary: Vec<_> = manifest
            .files
            .iter()
            .map(|f| (f.name.as_str(), f.path.as_str(), f.rows))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("listings", "snapshots/listings.parquet", 3),
                ("clusters", "snapshots/clusters.parquet", 2),
                ("changes", "snapshots/changes.parquet", 3),
            ]
        );
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).expect("snapshot exists");
            assert_eq!(hex::encode(Sha256::digest(&bytes)), file.sha256);
            assert_eq!(bytes.len() as u64, file.bytes);
        }
    }
}
