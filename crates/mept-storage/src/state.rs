use std::path::{Path, PathBuf};

use anyhow::Context;
use mept_core::{PersistedState, PreviousState};
use tokio::fs;
use tracing::{debug, error};

use crate::write_atomic;

/// The single JSON document a cycle reads once at the start and writes once at the end.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing document is a first run, anything else that
    /// cannot be read back becomes `Unreadable` for the engine to fail closed on.
    pub async fn load(&self) -> PreviousState {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted state yet");
                return PreviousState::FirstRun;
            }
            Err(err) => {
                let reason = format!("reading {}: {err}", self.path.display());
                error!(%reason, "persisted state unreadable");
                return PreviousState::Unreadable { reason };
            }
        };

        match serde_json::from_slice::<PersistedState>(&bytes) {
            Ok(state) => PreviousState::Loaded(state),
            Err(err) => {
                let reason = format!("parsing {}: {err}", self.path.display());
                error!(%reason, "persisted state unreadable");
                PreviousState::Unreadable { reason }
            }
        }
    }

    pub async fn save(&self, state: &PersistedState) -> anyhow::Result<()> {
        let mut bytes =
            serde_json::to_vec_pretty(state).context("serializing persisted state")?;
        bytes.push(b'\n');
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("saving state to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mept_core::{Category, HistoryEntry, Listing, SpecAttributes};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn sample_state() -> PersistedState {
        let listing = Listing {
            id: "scan__iphone_15_128gb".into(),
            store: "Scan".into(),
            raw_name: "iPhone 15 128GB".into(),
            canonical_name: "iphone 15 128gb".into(),
            price: dec!(999.00),
            price_text: "€999.00".into(),
            url: Some("https://scan.example/iphone-15".into()),
            image_ref: None,
            category: Category::IPhone,
            spec: SpecAttributes {
                storage_gb: Some(128),
                model_key: Some("iphone15".into()),
            },
            observed_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        };
        let mut state = PersistedState {
            products: vec![listing.clone()],
            last_updated: Some(Utc.with_ymd_and_hms(2026, 3, 1, 6, 1, 0).single().unwrap()),
            ..PersistedState::default()
        };
        state.matches.insert("iphone15_128".into(), vec![listing]);
        state.history.insert(
            "2026-03-01".into(),
            HistoryEntry {
                listing_count: 1,
                cluster_count: 1,
                drop_count: 0,
                new_count: 1,
            },
        );
        state
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("nested").join("prices.json"));
        let state = sample_state();

        store.save(&state).await.expect("save");
        assert_eq!(store.load().await, PreviousState::Loaded(state));
    }

    #[tokio::test]
    async fn missing_document_is_first_run() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("prices.json"));
        assert_eq!(store.load().await, PreviousState::FirstRun);
    }

    #[tokio::test]
    async fn corrupt_document_is_unreadable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("prices.json");
        std::fs::write(&path, b"{\"products\": [ {\"id\": ").expect("write");
        let store = StateStore::new(&path);
        match store.load().await {
            PreviousState::Unreadable { reason } => assert!(reason.contains("prices.json")),
            other => panic!("expected unreadable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_history_from_older_tracker_still_loads() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("prices.json");
        let doc = r#"{
          "products": [{
            "id": "scan_iphone_15",
            "store": "Scan Malta",
            "name": "iPhone 15 128GB",
            "price": 999,
            "priceText": "€999.00",
            "category": "iPhone",
            "scrapedAt": "2024-03-01T06:00:00.000Z"
          }],
          "history": { "1709272800000": [{ "name": "iPhone 15 128GB", "price": 999 }] }
        }"#;
        std::fs::write(&path, doc).expect("write");
        match StateStore::new(&path).load().await {
            PreviousState::Loaded(state) => {
                assert_eq!(state.products.len(), 1);
                assert_eq!(state.history["2024-03-01"].listing_count, 1);
            }
            other => panic!("expected loaded state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files_behind() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("prices.json"));
        store.save(&sample_state()).await.expect("first save");
        store.save(&PersistedState::default()).await.expect("second save");

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().into_string().expect("utf8"))
            .collect();
        assert_eq!(names, vec!["prices.json".to_string()]);
        assert_eq!(
            store.load().await,
            PreviousState::Loaded(PersistedState::default())
        );
    }
}
