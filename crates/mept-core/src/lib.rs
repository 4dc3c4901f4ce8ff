//! Core domain model for the price tracker: listings, clusters, changes, history.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "mept-core";

/// One scraped offer exactly as the fetcher handed it over. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListing {
    #[serde(default)]
    pub store_name: Option<String>,
    #[serde(default)]
    pub raw_name: Option<String>,
    #[serde(default)]
    pub raw_price_text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Coarse product classification derived from name keywords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    IPhone,
    MacBook,
    IPad,
    AppleWatch,
    AirPods,
    Samsung,
    GooglePixel,
    Laptop,
    Tablet,
    Audio,
    #[default]
    Other,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::IPhone => "iPhone",
            Category::MacBook => "MacBook",
            Category::IPad => "iPad",
            Category::AppleWatch => "Apple Watch",
            Category::AirPods => "AirPods",
            Category::Samsung => "Samsung",
            Category::GooglePixel => "Google Pixel",
            Category::Laptop => "Laptop",
            Category::Tablet => "Tablet",
            Category::Audio => "Audio",
            Category::Other => "Other",
        }
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        match value.as_str() {
            "iPhone" => Category::IPhone,
            "MacBook" => Category::MacBook,
            "iPad" => Category::IPad,
            "Apple Watch" => Category::AppleWatch,
            "AirPods" => Category::AirPods,
            "Samsung" => Category::Samsung,
            "Google Pixel" => Category::GooglePixel,
            "Laptop" => Category::Laptop,
            "Tablet" => Category::Tablet,
            "Audio" => Category::Audio,
            _ => Category::Other,
        }
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.label().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Attributes pulled out of a canonical name. Empty when no rule matched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
}

impl SpecAttributes {
    pub fn is_empty(&self) -> bool {
        self.storage_gb.is_none() && self.model_key().is_none()
    }

    /// Model key, ignoring an empty string.
    pub fn model_key(&self) -> Option<&str> {
        self.model_key.as_deref().filter(|k| !k.is_empty())
    }

    /// `<modelKey>_<storageGb|unknown>`; `None` when there is no model key.
    pub fn match_key(&self) -> Option<String> {
        let model = self.model_key()?;
        Some(match self.storage_gb {
            Some(gb) => format!("{model}_{gb}"),
            None => format!("{model}_unknown"),
        })
    }
}

/// One store's offer for one product at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub store: String,
    #[serde(rename = "name", alias = "rawName")]
    pub raw_name: String,
    #[serde(default)]
    pub canonical_name: String,
    pub price: Decimal,
    #[serde(default)]
    pub price_text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "imageUrl", alias = "imageRef")]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub category: Category,
    #[serde(default, skip_serializing_if = "SpecAttributes::is_empty")]
    pub spec: SpecAttributes,
    #[serde(rename = "scrapedAt", alias = "observedAt")]
    pub observed_at: DateTime<Utc>,
}

/// Listings from at least two distinct stores believed to be the same product,
/// ordered by ascending price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCluster {
    pub match_key: String,
    pub listings: Vec<Listing>,
    pub confidence: f64,
    pub review_required: bool,
}

impl MatchCluster {
    /// Cheapest member.
    pub fn best(&self) -> Option<&Listing> {
        self.listings.first()
    }

    pub fn distinct_stores(&self) -> usize {
        let mut stores: Vec<&str> = self.listings.iter().map(|l| l.store.as_str()).collect();
        stores.sort_unstable();
        stores.dedup();
        stores.len()
    }

    pub fn price_spread(&self) -> Decimal {
        match (self.listings.first(), self.listings.last()) {
            (Some(lo), Some(hi)) => hi.price - lo.price,
            _ => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Removed,
    Increased,
    Decreased,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Removed => "removed",
            ChangeKind::Increased => "increased",
            ChangeKind::Decreased => "decreased",
            ChangeKind::Unchanged => "unchanged",
        }
    }
}

/// Classification of one listing id against the previous cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub id: String,
    /// Current listing, or the previous one for `Removed`.
    pub listing: Listing,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub delta: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceChange {
    pub listing: Listing,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub delta: Decimal,
}

/// Consumer-facing summary of one cycle's changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReport {
    pub generated_at: DateTime<Utc>,
    pub new: Vec<Listing>,
    pub removed: Vec<Listing>,
    pub increased: Vec<PriceChange>,
    pub decreased: Vec<PriceChange>,
    pub unchanged_count: usize,
}

impl ChangeReport {
    pub fn total_changes(&self) -> usize {
        self.new.len() + self.removed.len() + self.increased.len() + self.decreased.len()
    }

    pub fn is_quiet(&self) -> bool {
        self.total_changes() == 0
    }
}

/// One calendar day's aggregate, keyed by `YYYY-MM-DD` in [`History`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "count")]
    pub listing_count: usize,
    #[serde(rename = "matches", default)]
    pub cluster_count: usize,
    #[serde(rename = "drops", default)]
    pub drop_count: usize,
    #[serde(rename = "new", default)]
    pub new_count: usize,
}

pub type History = BTreeMap<String, HistoryEntry>;

/// `chrono` format of [`History`] keys.
pub const HISTORY_DATE_FORMAT: &str = "%Y-%m-%d";

/// History values as older tracker documents wrote them.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredHistoryValue {
    Entry(HistoryEntry),
    /// A full product list per run; only its length is kept.
    Snapshot(Vec<IgnoredAny>),
    Other(IgnoredAny),
}

impl StoredHistoryValue {
    fn into_entry(self) -> Option<HistoryEntry> {
        match self {
            StoredHistoryValue::Entry(entry) => Some(entry),
            StoredHistoryValue::Snapshot(products) => Some(HistoryEntry {
                listing_count: products.len(),
                ..HistoryEntry::default()
            }),
            StoredHistoryValue::Other(_) => None,
        }
    }
}

/// Reads history entry by entry. Values of unknown shape are skipped rather
/// than failing the whole document, and epoch-millisecond keys are folded into
/// their UTC day (latest run wins; an existing day key wins over both).
fn deserialize_history<'de, D>(deserializer: D) -> Result<History, D::Error>
where
    D: Deserializer<'de>,
{
    let stored = BTreeMap::<String, StoredHistoryValue>::deserialize(deserializer)?;
    let mut history = History::new();
    let mut stamped: Vec<(i64, HistoryEntry)> = Vec::new();
    for (key, value) in stored {
        let Some(entry) = value.into_entry() else {
            continue;
        };
        match key.parse::<i64>() {
            Ok(millis) => stamped.push((millis, entry)),
            Err(_) => {
                history.insert(key, entry);
            }
        }
    }

    stamped.sort_by_key(|(millis, _)| *millis);
    let mut by_day = History::new();
    for (millis, entry) in stamped {
        if let Some(at) = DateTime::<Utc>::from_timestamp_millis(millis) {
            by_day.insert(at.date_naive().format(HISTORY_DATE_FORMAT).to_string(), entry);
        }
    }
    for (day, entry) in by_day {
        history.entry(day).or_insert(entry);
    }
    Ok(history)
}

/// The document read at the start and written at the end of every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub products: Vec<Listing>,
    #[serde(default)]
    pub matches: BTreeMap<String, Vec<Listing>>,
    #[serde(default, deserialize_with = "deserialize_history")]
    pub history: History,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// What the persistence layer could recover before a cycle starts.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviousState {
    FirstRun,
    Loaded(PersistedState),
    Unreadable { reason: String },
}

impl PreviousState {
    pub fn listings(&self) -> &[Listing] {
        match self {
            PreviousState::Loaded(state) => &state.products,
            _ => &[],
        }
    }
}

/// Policy knobs the engine accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Prices at or below this are treated as accessories/noise.
    pub price_floor: Decimal,
    pub min_cluster_stores: usize,
    pub retention_days: u32,
    /// Clusters whose name similarity falls below this are flagged for review.
    pub review_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            price_floor: Decimal::from(50),
            min_cluster_stores: 2,
            retention_days: 30,
            review_threshold: 0.85,
        }
    }
}

impl EngineConfig {
    /// A cluster always spans at least two stores regardless of configuration.
    pub fn effective_min_cluster_stores(&self) -> usize {
        self.min_cluster_stores.max(2)
    }
}

/// Per-cycle tallies of everything absorbed instead of failing the cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleDiagnostics {
    pub raw_received: usize,
    pub accepted: usize,
    pub missing_store: usize,
    pub missing_name: usize,
    pub unparseable_price: usize,
    pub below_floor: usize,
    pub duplicate_ids: usize,
    pub without_model_key: usize,
    pub unclustered_with_model_key: usize,
    pub review_clusters: usize,
    pub state_unreadable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_error: Option<String>,
}

impl CycleDiagnostics {
    pub fn dropped(&self) -> usize {
        self.missing_store
            + self.missing_name
            + self.unparseable_price
            + self.below_floor
            + self.duplicate_ids
    }
}
