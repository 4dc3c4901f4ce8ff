//! Store adapters: turn captured category pages into raw listings for the engine.

mod feed;
mod grid;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mept_core::RawListing;
use mept_storage::HttpFetcher;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use feed::JsonFeedAdapter;
pub use grid::{absolutize_url, HtmlGridAdapter, SelectorCascade};

pub const CRATE_NAME: &str = "mept-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageFormat {
    Html,
    Json,
}

impl PageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PageFormat::Html => "html",
            PageFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// One category page to fetch, e.g. `https://www.klikk.com.mt/mobile-phones`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTarget {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid product feed: {0}")]
    InvalidFeed(String),
    #[error("bundle for store {found:?} handed to adapter for {expected:?}")]
    StoreMismatch { expected: String, found: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Display name written into every raw listing (`Scan Malta`).
    fn store_name(&self) -> &str;
    fn store_slug(&self) -> &str;
    fn format(&self) -> PageFormat;

    /// Fetch every target. A target that fails is logged and skipped; the
    /// store then simply contributes fewer listings this cycle.
    async fn fetch_category_pages(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[CategoryTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(targets.len());
        for target in targets {
            match http.fetch_bytes(ctx.run_id, self.store_slug(), &target.url).await {
                Ok(resp) => pages.push(FetchedPage {
                    url: resp.final_url,
                    body: resp.body,
                    fetched_at: ctx.fetched_at,
                }),
                Err(err) => warn!(
                    store = self.store_slug(),
                    url = %target.url,
                    error = %err,
                    "category page fetch failed; skipping"
                ),
            }
        }
        debug!(store = self.store_slug(), pages = pages.len(), "fetched category pages");
        Ok(pages)
    }

    fn parse_category_page(&self, page_url: &str, body: &str) -> Result<Vec<RawListing>, AdapterError>;

    fn parse_bundle(&self, bundle: &CaptureBundle) -> Result<Vec<RawListing>, AdapterError> {
        if bundle.store_slug != self.store_slug() {
            return Err(AdapterError::StoreMismatch {
                expected: self.store_slug().to_string(),
                found: bundle.store_slug.clone(),
            });
        }
        let Some(text) = bundle.raw_page.inline_text.as_deref() else {
            return Ok(Vec::new());
        };
        self.parse_category_page(&bundle.captured_from_url, text)
    }
}

/// A category page captured once and replayed offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBundle {
    pub bundle_id: String,
    pub store_slug: String,
    pub format: PageFormat,
    pub captured_from_url: String,
    pub captured_at: DateTime<Utc>,
    pub raw_page: RawPage,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPage {
    pub content_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

pub fn load_capture_bundle(path: impl AsRef<Path>) -> Result<CaptureBundle> {
    let path = path.as_ref();
    let mut bundle: CaptureBundle = read_json_file(path)?;
    hydrate_raw_page(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Pull a raw page referenced by relative path into `inline_text`.
fn hydrate_raw_page(bundle_path: &Path, bundle: &mut CaptureBundle) -> Result<()> {
    if bundle.raw_page.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &bundle.raw_page.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading captured page {}", raw_path.display()))?;
    bundle.raw_page.inline_text = Some(raw);
    Ok(())
}

/// Build the adapter for a store entry.
pub fn adapter_for_store(
    store_name: &str,
    store_slug: &str,
    base_url: &str,
    format: PageFormat,
) -> Result<Box<dyn StoreAdapter>, AdapterError> {
    Ok(match format {
        PageFormat::Html => Box::new(HtmlGridAdapter::new(
            store_name,
            store_slug,
            base_url,
            SelectorCascade::default(),
        )?),
        PageFormat::Json => Box::new(JsonFeedAdapter::new(store_name, store_slug, base_url)),
    })
}

pub(crate) fn non_blank(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}
