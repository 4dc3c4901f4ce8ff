//! Reconciliation engine and the sync pipeline that drives it once per cycle.

pub mod cycle;
pub mod differ;
pub mod export;
pub mod ledger;
pub mod matcher;
pub mod normalize;
pub mod price;
pub mod report;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use mept_adapters::{
    adapter_for_store, load_capture_bundle, AdapterContext, CategoryTarget, PageFormat,
    StoreAdapter,
};
use mept_core::{EngineConfig, RawListing};
use mept_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, StateStore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use cycle::{run_cycle, CycleOutcome, ReconciliationEngine, Rejection};
pub use differ::{build_report, diff};
pub use matcher::{match_listings, MatchOutcome, Matcher};
pub use normalize::{extract_spec, listing_id, normalize, Normalizer};
pub use price::{parse_price, PriceError, PriceParser};
pub use report::{report_daily_markdown, RunRecord};

pub const CRATE_NAME: &str = "mept-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct StoreRegistry {
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Live,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub store: String,
    pub slug: String,
    pub enabled: bool,
    pub mode: StoreMode,
    pub format: PageFormat,
    pub base_url: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl StoreConfig {
    pub fn category_targets(&self) -> Vec<CategoryTarget> {
        let base = self.base_url.trim_end_matches('/');
        self.categories
            .iter()
            .map(|path| CategoryTarget {
                url: format!("{base}/{}", path.trim_start_matches('/')),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_file: PathBuf,
    pub stores_file: PathBuf,
    pub fixtures_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub engine: EngineConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        Self {
            state_file: env_path("MEPT_STATE_FILE", "prices.json"),
            stores_file: env_path("MEPT_STORES_FILE", "stores.yaml"),
            fixtures_dir: env_path("MEPT_FIXTURES_DIR", "fixtures"),
            artifacts_dir: env_path("ARTIFACTS_DIR", "./artifacts"),
            reports_dir: env_path("MEPT_REPORTS_DIR", "./reports"),
            scheduler_enabled: std::env::var("MEPT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
            user_agent: std::env::var("MEPT_USER_AGENT")
                .unwrap_or_else(|_| "mept-bot/0.1".to_string()),
            http_timeout_secs: env_parse("MEPT_HTTP_TIMEOUT_SECS").unwrap_or(20),
            engine: EngineConfig {
                price_floor: env_parse::<Decimal>("MEPT_PRICE_FLOOR")
                    .unwrap_or(defaults.price_floor),
                min_cluster_stores: env_parse("MEPT_MIN_CLUSTER_STORES")
                    .unwrap_or(defaults.min_cluster_stores),
                retention_days: env_parse("MEPT_RETENTION_DAYS").unwrap_or(defaults.retention_days),
                review_threshold: env_parse("MEPT_REVIEW_THRESHOLD")
                    .unwrap_or(defaults.review_threshold),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: chrono::DateTime<Utc>,
    pub enabled_stores: usize,
    pub archived_pages: usize,
    pub raw_listings: usize,
    pub accepted_listings: usize,
    pub clusters: usize,
    pub new: usize,
    pub removed: usize,
    pub increased: usize,
    pub decreased: usize,
    pub state_unreadable: bool,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

struct StoreHarvest {
    pages: usize,
    listings: Vec<RawListing>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    artifact_store: ArtifactStore,
    state_store: StateStore,
    http: HttpFetcher,
    engine: ReconciliationEngine,
    /// Held for a whole cycle: the state file has a single writer.
    cycle_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            artifact_store: ArtifactStore::new(config.artifacts_dir.clone()),
            state_store: StateStore::new(config.state_file.clone()),
            engine: ReconciliationEngine::new(config.engine.clone()),
            http,
            cycle_lock: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _cycle = self.cycle_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_store_registry().await?;
        let enabled: Vec<_> = registry.stores.into_iter().filter(|s| s.enabled).collect();
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };

        let mut raw = Vec::new();
        let mut archived_pages = 0usize;
        let mut per_store: BTreeMap<String, usize> = BTreeMap::new();
        for store in &enabled {
            let adapter = adapter_for_store(&store.store, &store.slug, &store.base_url, store.format)
                .with_context(|| format!("building adapter for {}", store.slug))?;
            let harvest = match store.mode {
                StoreMode::Live => self.harvest_live(adapter.as_ref(), store, &ctx).await,
                StoreMode::Fixture => self.harvest_fixture(adapter.as_ref(), store).await,
            };
            match harvest {
                Ok(harvest) => {
                    archived_pages += harvest.pages;
                    per_store.insert(store.store.clone(), harvest.listings.len());
                    raw.extend(harvest.listings);
                }
                Err(err) => {
                    warn!(store = %store.slug, error = %format!("{err:#}"), "store contributed no listings this cycle");
                    per_store.insert(store.store.clone(), 0);
                }
            }
        }
        info!(%run_id, stores = enabled.len(), raw = raw.len(), ?per_store, "gathered raw listings");

        let previous = self.state_store.load().await;
        let outcome = self.engine.run_cycle(previous, &raw, Utc::now());

        let finished_at = Utc::now();
        let run = RunRecord {
            run_id,
            started_at,
            finished_at,
            stores: enabled.iter().map(|s| s.store.clone()).collect(),
            diagnostics: outcome.diagnostics.clone(),
            cluster_count: outcome.clusters.len(),
        };
        let reports_dir = self.write_reports(&run, &outcome).await?;
        let manifest_path = export::export_snapshots(&reports_dir, &outcome)?;
        // State is saved only once every report is on disk.
        self.state_store.save(&outcome.state).await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            enabled_stores: enabled.len(),
            archived_pages,
            raw_listings: raw.len(),
            accepted_listings: outcome.diagnostics.accepted,
            clusters: outcome.clusters.len(),
            new: outcome.report.new.len(),
            removed: outcome.report.removed.len(),
            increased: outcome.report.increased.len(),
            decreased: outcome.report.decreased.len(),
            state_unreadable: outcome.diagnostics.state_unreadable,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    async fn load_store_registry(&self) -> Result<StoreRegistry> {
        let path = &self.config.stores_file;
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn harvest_live(
        &self,
        adapter: &dyn StoreAdapter,
        store: &StoreConfig,
        ctx: &AdapterContext,
    ) -> Result<StoreHarvest> {
        let pages = adapter
            .fetch_category_pages(&self.http, ctx, &store.category_targets())
            .await?;
        let mut listings = Vec::new();
        for page in &pages {
            self.artifact_store
                .store_page(ctx.fetched_at, &store.slug, store.format.extension(), &page.body)
                .await?;
            match adapter.parse_category_page(&page.url, &page.text()) {
                Ok(found) => listings.extend(found),
                Err(err) => warn!(store = %store.slug, url = %page.url, error = %err, "unparseable category page"),
            }
        }
        Ok(StoreHarvest {
            pages: pages.len(),
            listings,
        })
    }

    async fn harvest_fixture(&self, adapter: &dyn StoreAdapter, store: &StoreConfig) -> Result<StoreHarvest> {
        let bundle_path = self
            .config
            .fixtures_dir
            .join(&store.slug)
            .join("sample")
            .join("bundle.json");
        let bundle = load_capture_bundle(&bundle_path)?;
        let body = bundle.raw_page.inline_text.as_deref().unwrap_or_default();
        self.artifact_store
            .store_page(bundle.captured_at, &store.slug, bundle.format.extension(), body.as_bytes())
            .await?;
        Ok(StoreHarvest {
            pages: 1,
            listings: adapter.parse_bundle(&bundle)?,
        })
    }

    async fn write_reports(&self, run: &RunRecord, outcome: &CycleOutcome) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(run.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let report_json =
            serde_json::to_vec_pretty(&outcome.report).context("serializing change report")?;
        fs::write(reports_dir.join("change_report.json"), report_json)
            .await
            .context("writing change_report.json")?;

        let run_json = serde_json::to_vec_pretty(run).context("serializing run record")?;
        fs::write(reports_dir.join("run.json"), run_json)
            .await
            .context("writing run.json")?;

        let brief = report::daily_brief(run, &outcome.report, &outcome.clusters);
        fs::write(reports_dir.join("daily_brief.md"), brief)
            .await
            .context("writing daily_brief.md")?;

        Ok(reports_dir)
    }
}

/// A scheduler running `run_once` on the configured cron, or `None` when scheduling is off.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    accepted = summary.accepted_listings,
                    clusters = summary.clusters,
                    decreased = summary.decreased,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use mept_core::{PersistedState, PreviousState};
    use tempfile::{tempdir, TempDir};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn test_config(dir: &TempDir) -> SyncConfig {
        let root = workspace_root();
        SyncConfig {
            state_file: dir.path().join("prices.json"),
            stores_file: root.join("stores.yaml"),
            fixtures_dir: root.join("fixtures"),
            artifacts_dir: dir.path().join("artifacts"),
            reports_dir: dir.path().join("reports"),
            scheduler_enabled: false,
            sync_cron: "0 6 * * *".to_string(),
            user_agent: "mept-test".to_string(),
            http_timeout_secs: 5,
            engine: EngineConfig::default(),
        }
    }

    #[test]
    fn store_registry_parses() {
        let text = std::fs::read_to_string(workspace_root().join("stores.yaml")).expect("read");
        let registry: StoreRegistry = serde_yaml::from_str(&text).expect("parse");
        assert_eq!(registry.stores.len(), 4);
        let intercomp = registry.stores.iter().find(|s| s.slug == "intercomp").unwrap();
        assert!(!intercomp.enabled);
        assert_eq!(intercomp.mode, StoreMode::Live);
        assert_eq!(
            intercomp.category_targets()[1].url,
            "https://www.intercomp.com.mt/computers/laptops"
        );
        let megatekk = registry.stores.iter().find(|s| s.slug == "megatekk").unwrap();
        assert_eq!(megatekk.format, PageFormat::Json);
    }

    #[tokio::test]
    async fn fixture_cycle_end_to_end() {
        let dir = tempdir().expect("tempdir");
        let pipeline = SyncPipeline::new(test_config(&dir)).expect("pipeline");

        let first = pipeline.run_once().await.expect("first run");
        assert_eq!(first.enabled_stores, 3);
        assert_eq!(first.archived_pages, 3);
        assert_eq!(first.raw_listings, 12);
        assert_eq!(first.accepted_listings, 9);
        assert_eq!(first.clusters, 3);
        assert_eq!(first.new, 9);
        assert!(!first.state_unreadable);

        let reports_dir = PathBuf::from(&first.reports_dir);
        for file in ["change_report.json", "run.json", "daily_brief.md"] {
            assert!(reports_dir.join(file).exists(), "{file} missing");
        }
        assert!(Path::new(&first.parquet_manifest).exists());

        let state = match pipeline.state_store.load().await {
            PreviousState::Loaded(state) => state,
            other => panic!("expected saved state, got {other:?}"),
        };
        let keys: Vec<_> = state.matches.keys().cloned().collect();
        assert_eq!(keys, vec!["galaxys24_256", "iphone15_128", "pixel8_128"]);
        let iphone_stores: Vec<_> = state.matches["iphone15_128"]
            .iter()
            .map(|l| l.store.as_str())
            .collect();
        assert_eq!(iphone_stores, vec!["Scan Malta", "Megatekk", "Klikk"]);

        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.new + second.removed + second.increased + second.decreased, 0);

        let markdown = report_daily_markdown(5, &dir.path().join("reports")).expect("report");
        assert!(markdown.contains(&first.run_id.to_string()));
        assert!(markdown.contains(&second.run_id.to_string()));
    }

    #[tokio::test]
    async fn corrupt_state_file_does_not_stop_the_cycle() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(&dir);
        std::fs::write(&config.state_file, b"not json at all").expect("write corrupt state");
        let pipeline = SyncPipeline::new(config).expect("pipeline");

        let summary = pipeline.run_once().await.expect("run");
        assert!(summary.state_unreadable);
        assert_eq!(summary.new, summary.accepted_listings);
        assert!(matches!(
            pipeline.state_store.load().await,
            PreviousState::Loaded(PersistedState { .. })
        ));
    }

    #[tokio::test]
    async fn failed_report_write_leaves_state_untouched() {
        let dir = tempdir().expect("tempdir");
        let blocked = dir.path().join("reports-file");
        std::fs::write(&blocked, b"not a directory").expect("write blocker");
        let config = SyncConfig {
            reports_dir: blocked,
            ..test_config(&dir)
        };
        let state_file = config.state_file.clone();
        let pipeline = SyncPipeline::new(config).expect("pipeline");
        assert!(pipeline.run_once().await.is_err());
        assert!(!state_file.exists());

        let retry = SyncPipeline::new(test_config(&dir)).expect("pipeline");
        let summary = retry.run_once().await.expect("run");
        assert_eq!(summary.new, summary.accepted_listings);
        assert!(state_file.exists());
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let dir = tempdir().expect("tempdir");
        let pipeline = Arc::new(SyncPipeline::new(test_config(&dir)).expect("pipeline"));
        assert!(build_scheduler(pipeline).await.expect("build").is_none());
    }
}
