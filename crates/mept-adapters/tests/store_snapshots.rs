use std::fs;
use std::path::{Path, PathBuf};

use mept_adapters::{adapter_for_store, load_capture_bundle, PageFormat, StoreAdapter};
use mept_core::RawListing;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn sample_dir(slug: &str) -> PathBuf {
    workspace_root().join("fixtures").join(slug).join("sample")
}

fn read_snapshot(slug: &str) -> Vec<RawListing> {
    let text = fs::read_to_string(sample_dir(slug).join("snapshot.json")).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

fn parse_sample(adapter: &dyn StoreAdapter) -> Vec<RawListing> {
    let bundle = load_capture_bundle(sample_dir(adapter.store_slug()).join("bundle.json"))
        .expect("load bundle");
    assert_eq!(bundle.format, adapter.format());
    adapter.parse_bundle(&bundle).expect("parse bundle")
}

#[test]
fn golden_snapshot_scan_malta() {
    let adapter = adapter_for_store("Scan Malta", "scan-malta", "https://www.scanmalta.com", PageFormat::Html)
        .expect("adapter");
    assert_eq!(parse_sample(adapter.as_ref()), read_snapshot("scan-malta"));
}

#[test]
fn golden_snapshot_klikk() {
    let adapter = adapter_for_store("Klikk", "klikk", "https://www.klikk.com.mt", PageFormat::Html)
        .expect("adapter");
    assert_eq!(parse_sample(adapter.as_ref()), read_snapshot("klikk"));
}

#[test]
fn golden_snapshot_megatekk() {
    let adapter = adapter_for_store("Megatekk", "megatekk", "https://www.megatekk.com.mt", PageFormat::Json)
        .expect("adapter");
    assert_eq!(parse_sample(adapter.as_ref()), read_snapshot("megatekk"));
}

#[test]
fn every_fixture_store_has_bundle_and_snapshot() {
    for slug in ["scan-malta", "klikk", "megatekk"] {
        let dir = sample_dir(slug);
        assert!(dir.join("bundle.json").exists(), "{slug} bundle");
        assert!(dir.join("snapshot.json").exists(), "{slug} snapshot");
    }
}
