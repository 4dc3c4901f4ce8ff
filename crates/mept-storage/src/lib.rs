//! Persisted state, raw page archive and rate-limited HTTP for the price tracker.

mod artifacts;
mod http;
mod state;

use std::path::Path;

use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, retry_after, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use state::StateStore;

pub const CRATE_NAME: &str = "mept-storage";

/// Write `bytes` to a sibling temp file and rename it over `target`.
/// Readers see either the old contents or the new, never a partial file.
pub(crate) async fn write_atomic(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
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
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming {} -> {}",
                temp_path.display(),
                target.display()
            )
        });
    }
    Ok(())
}
