//! One reconciliation cycle: intake, dedupe, match, diff, ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mept_core::{
    ChangeRecord, ChangeReport, CycleDiagnostics, EngineConfig, HistoryEntry, Listing,
    MatchCluster, PersistedState, PreviousState, RawListing,
};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::differ::{build_report, diff};
use crate::ledger;
use crate::matcher::Matcher;
use crate::normalize::{detect_category, extract_spec, listing_id, Normalizer};
use crate::price::{PriceError, PriceParser};

/// Why a raw listing did not make it into the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("listing has no store name")]
    MissingStore,
    #[error("listing has no usable name")]
    MissingName,
    #[error(transparent)]
    Price(#[from] PriceError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub state: PersistedState,
    pub report: ChangeReport,
    pub clusters: Vec<MatchCluster>,
    /// Every classified id, unchanged ones included.
    pub changes: Vec<ChangeRecord>,
    pub diagnostics: CycleDiagnostics,
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    config: EngineConfig,
    normalizer: Normalizer,
    prices: PriceParser,
    matcher: Matcher,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            normalizer: Normalizer::default(),
            prices: PriceParser::new(config.price_floor),
            matcher: Matcher::new(&config),
            config,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Turn one raw record into a listing, or say why it cannot be one.
    pub fn intake(&self, raw: &RawListing, now: DateTime<Utc>) -> Result<Listing, Rejection> {
        let store = non_blank(raw.store_name.as_deref()).ok_or(Rejection::MissingStore)?;
        let raw_name = non_blank(raw.raw_name.as_deref()).ok_or(Rejection::MissingName)?;
        let canonical_name = self.normalizer.normalize(raw_name);
        if canonical_name.is_empty() {
            return Err(Rejection::MissingName);
        }
        let price_text = raw.raw_price_text.as_deref().unwrap_or_default().trim();
        let price = self.prices.parse(price_text)?;

        Ok(Listing {
            id: listing_id(store, &canonical_name),
            store: store.to_string(),
            raw_name: raw_name.to_string(),
            price,
            price_text: price_text.to_string(),
            url: non_blank(raw.url.as_deref()).map(str::to_string),
            image_ref: non_blank(raw.image_url.as_deref()).map(str::to_string),
            category: detect_category(&canonical_name),
            spec: extract_spec(&canonical_name),
            canonical_name,
            observed_at: now,
        })
    }

    pub fn run_cycle(
        &self,
        previous: PreviousState,
        raw: &[RawListing],
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let mut diagnostics = CycleDiagnostics {
            raw_received: raw.len(),
            ..CycleDiagnostics::default()
        };

        let prior = match previous {
            PreviousState::FirstRun => PersistedState::default(),
            PreviousState::Loaded(state) => state,
            PreviousState::Unreadable { reason } => {
                error!(%reason, "previous state unreadable; continuing as first run");
                diagnostics.state_unreadable = true;
                diagnostics.state_error = Some(reason);
                PersistedState::default()
            }
        };

        let mut accepted = Vec::with_capacity(raw.len());
        for (index, record) in raw.iter().enumerate() {
            match self.intake(record, now) {
                Ok(listing) => accepted.push(listing),
                Err(rejection) => {
                    debug!(index, store = ?record.store_name, %rejection, "dropped raw listing");
                    tally(&mut diagnostics, &rejection);
                }
            }
        }

        let (survivors, duplicates) = dedupe_by_id(accepted);
        diagnostics.duplicate_ids = duplicates;
        diagnostics.accepted = survivors.len();

        let matched = self.matcher.match_listings(&survivors);
        diagnostics.without_model_key = matched.without_model_key;
        diagnostics.unclustered_with_model_key = matched.unclustered_with_model_key;
        diagnostics.review_clusters = matched.clusters.iter().filter(|c| c.review_required).count();

        let changes = diff(&prior.products, &survivors);
        let report = build_report(&changes, now);

        let today = now.date_naive();
        let entry = HistoryEntry {
            listing_count: survivors.len(),
            cluster_count: matched.clusters.len(),
            drop_count: report.decreased.len(),
            new_count: report.new.len(),
        };
        let history = ledger::record(prior.history, today, entry);
        let history = ledger::prune(history, self.config.retention_days, today);

        let matches: BTreeMap<String, Vec<Listing>> = matched
            .clusters
            .iter()
            .map(|c| (c.match_key.clone(), c.listings.clone()))
            .collect();

        info!(
            raw = diagnostics.raw_received,
            accepted = diagnostics.accepted,
            dropped = diagnostics.dropped(),
            clusters = matched.clusters.len(),
            new = report.new.len(),
            removed = report.removed.len(),
            increased = report.increased.len(),
            decreased = report.decreased.len(),
            "reconciliation cycle complete"
        );

        CycleOutcome {
            state: PersistedState {
                products: survivors,
                matches,
                history,
                last_updated: Some(now),
            },
            report,
            clusters: matched.clusters,
            changes,
            diagnostics,
        }
    }
}

pub fn run_cycle(
    previous: PreviousState,
    raw: &[RawListing],
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> CycleOutcome {
    ReconciliationEngine::new(config.clone()).run_cycle(previous, raw, now)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn tally(diagnostics: &mut CycleDiagnostics, rejection: &Rejection) {
    match rejection {
        Rejection::MissingStore => diagnostics.missing_store += 1,
        Rejection::MissingName => diagnostics.missing_name += 1,
        Rejection::Price(PriceError::BelowFloor { .. }) => diagnostics.below_floor += 1,
        Rejection::Price(_) => diagnostics.unparseable_price += 1,
    }
}

/// One listing per id, ordered by id. The cheapest offer wins, then the
/// smaller url. Returns the survivors and how many were discarded.
pub fn dedupe_by_id(listings: Vec<Listing>) -> (Vec<Listing>, usize) {
    let total = listings.len();
    let mut by_id: BTreeMap<String, Listing> = BTreeMap::new();
    for listing in listings {
        match by_id.get(&listing.id) {
            Some(kept) if (kept.price, &kept.url) <= (listing.price, &listing.url) => {}
            _ => {
                by_id.insert(listing.id.clone(), listing);
            }
        }
    }
    let survivors: Vec<Listing> = by_id.into_values().collect();
    let discarded = total - survivors.len();
    (survivors, discarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use mept_core::{Category, ChangeKind};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::normalize::normalize;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).single().unwrap()
    }

    fn raw(store: &str, name: &str, price: &str) -> RawListing {
        RawListing {
            store_name: Some(store.to_string()),
            raw_name: Some(name.to_string()),
            raw_price_text: Some(price.to_string()),
            url: None,
            image_url: None,
        }
    }

    fn previous_listing(store: &str, name: &str, price: Decimal) -> Listing {
        let canonical = normalize(name);
        Listing {
            id: listing_id(store, &canonical),
            store: store.to_string(),
            raw_name: name.to_string(),
            spec: extract_spec(&canonical),
            category: detect_category(&canonical),
            canonical_name: canonical,
            price,
            price_text: format!("€{price}"),
            url: None,
            image_ref: None,
            observed_at: now() - Duration::days(1),
        }
    }

    #[test]
    fn scan_and_klikk_iphone_scenario() {
        let old = previous_listing("Scan", "iPhone 15 128GB", dec!(1099));
        assert_eq!(old.id, "scan__iphone_15_128gb");
        let previous = PreviousState::Loaded(PersistedState {
            products: vec![old],
            ..PersistedState::default()
        });
        let current = vec![
            raw("Scan", "iPhone 15 128GB", "€999.00"),
            raw("Klikk", "Apple iPhone 15 128GB", "€1,050"),
        ];

        let outcome = run_cycle(previous, &current, &EngineConfig::default(), now());

        assert_eq!(outcome.clusters.len(), 1);
        let cluster = &outcome.clusters[0];
        assert_eq!(cluster.match_key, "iphone15_128");
        let members: Vec<_> = cluster
            .listings
            .iter()
            .map(|l| (l.store.as_str(), l.price))
            .collect();
        assert_eq!(members, vec![("Scan", dec!(999.00)), ("Klikk", dec!(1050))]);
        for listing in &cluster.listings {
            assert_eq!(listing.spec.model_key(), Some("iphone15"));
            assert_eq!(listing.spec.storage_gb, Some(128));
            assert_eq!(listing.category, Category::IPhone);
        }

        assert_eq!(outcome.report.decreased.len(), 1);
        let drop = &outcome.report.decreased[0];
        assert_eq!(drop.listing.id, "scan__iphone_15_128gb");
        assert_eq!(drop.delta, dec!(100));
        assert_eq!(outcome.report.new.len(), 1);
        assert_eq!(outcome.report.new[0].id, "klikk__iphone_15_128gb");
        assert!(outcome.report.removed.is_empty());

        let entry = outcome.state.history["2026-03-02"];
        assert_eq!(entry.listing_count, 2);
        assert_eq!(entry.cluster_count, 1);
        assert_eq!(entry.drop_count, 1);
        assert_eq!(entry.new_count, 1);
        assert!(outcome.state.matches.contains_key("iphone15_128"));
        assert_eq!(outcome.state.last_updated, Some(now()));
    }

    #[test]
    fn malformed_listings_are_dropped_and_counted() {
        let current = vec![
            raw("Scan", "iPhone 15 128GB", "€999.00"),
            RawListing {
                store_name: None,
                ..raw("Scan", "iPad Air", "€699")
            },
            RawListing {
                raw_name: Some("   ".into()),
                ..raw("Scan", "x", "€699")
            },
            RawListing {
                raw_price_text: None,
                ..raw("Klikk", "Pixel 8 128GB", "")
            },
            raw("Klikk", "Lightning Cable", "€19.99"),
            raw("Klikk", "Galaxy S24 256GB", "Call for price"),
        ];

        let outcome = run_cycle(PreviousState::FirstRun, &current, &EngineConfig::default(), now());
        let d = &outcome.diagnostics;
        assert_eq!(d.raw_received, 6);
        assert_eq!(d.accepted, 1);
        assert_eq!(d.missing_store, 1);
        assert_eq!(d.missing_name, 1);
        assert_eq!(d.unparseable_price, 2);
        assert_eq!(d.below_floor, 1);
        assert_eq!(d.dropped(), 5);
        assert_eq!(outcome.state.products.len(), 1);
        assert!(!d.state_unreadable);
    }

    #[test]
    fn unreadable_state_fails_closed_to_first_run() {
        let previous = PreviousState::Unreadable {
            reason: "expected value at line 1 column 1".into(),
        };
        let current = vec![
            raw("Scan", "iPhone 15 128GB", "€999.00"),
            raw("Klikk", "MacBook Air M2 256GB", "€1,199"),
        ];
        let outcome = run_cycle(previous, &current, &EngineConfig::default(), now());
        assert!(outcome.diagnostics.state_unreadable);
        assert!(outcome.diagnostics.state_error.is_some());
        assert_eq!(outcome.report.new.len(), 2);
        assert!(outcome.report.removed.is_empty());
        assert_eq!(outcome.state.history.len(), 1);
    }

    #[test]
    fn repeated_cycle_with_same_input_is_quiet() {
        let current = vec![
            raw("Scan", "iPhone 15 128GB", "€999.00"),
            raw("Klikk", "Apple iPhone 15 128GB", "€1,050"),
        ];
        let config = EngineConfig::default();
        let first = run_cycle(PreviousState::FirstRun, &current, &config, now());
        let second = run_cycle(
            PreviousState::Loaded(first.state),
            &current,
            &config,
            now() + Duration::hours(1),
        );
        assert!(second.report.is_quiet());
        assert_eq!(second.report.unchanged_count, 2);
        assert!(second
            .changes
            .iter()
            .all(|c| c.kind == ChangeKind::Unchanged));
        assert_eq!(second.state.history.len(), 1);
    }

    #[test]
    fn duplicate_ids_keep_the_cheapest_offer() {
        let mut expensive = raw("Scan", "iPhone 15 128GB", "€1,049");
        expensive.url = Some("https://scan.example/a".into());
        let mut cheap = raw("Scan", "iPhone 15 (128GB)", "€999");
        cheap.url = Some("https://scan.example/b".into());

        let outcome = run_cycle(
            PreviousState::FirstRun,
            &[expensive, cheap],
            &EngineConfig::default(),
            now(),
        );
        assert_eq!(outcome.diagnostics.duplicate_ids, 1);
        assert_eq!(outcome.state.products.len(), 1);
        assert_eq!(outcome.state.products[0].price, dec!(999));
        assert_eq!(
            outcome.state.products[0].url.as_deref(),
            Some("https://scan.example/b")
        );
    }

    #[test]
    fn plus_models_are_not_duplicates_of_the_base_model() {
        let outcome = run_cycle(
            PreviousState::FirstRun,
            &[
                raw("Klikk", "Samsung Galaxy S24 256GB", "€899"),
                raw("Klikk", "Samsung Galaxy S24+ 256GB", "€1,099"),
            ],
            &EngineConfig::default(),
            now(),
        );
        assert_eq!(outcome.diagnostics.duplicate_ids, 0);
        let ids: Vec<_> = outcome.state.products.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["klikk__galaxy_s24_256gb", "klikk__galaxy_s24_plus_256gb"]);
        assert_eq!(outcome.report.new.len(), 2);
    }

    #[test]
    fn oversized_retention_does_not_abort_the_cycle() {
        let config = EngineConfig {
            retention_days: u32::MAX,
            ..EngineConfig::default()
        };
        let outcome = run_cycle(
            PreviousState::FirstRun,
            &[raw("Scan", "iPhone 15 128GB", "€999.00")],
            &config,
            now(),
        );
        assert_eq!(outcome.state.products.len(), 1);
        assert!(outcome.state.history.contains_key("2026-03-02"));
    }

    #[test]
    fn old_history_is_pruned_on_cycle() {
        let mut state = PersistedState::default();
        state.history.insert(
            "2026-01-01".into(),
            HistoryEntry {
                listing_count: 3,
                ..HistoryEntry::default()
            },
        );
        state.history.insert(
            "2026-02-20".into(),
            HistoryEntry {
                listing_count: 4,
                ..HistoryEntry::default()
            },
        );
        let outcome = run_cycle(
            PreviousState::Loaded(state),
            &[raw("Scan", "iPhone 15 128GB", "€999.00")],
            &EngineConfig::default(),
            now(),
        );
        let keys: Vec<_> = outcome.state.history.keys().cloned().collect();
        assert_eq!(keys, vec!["2026-02-20".to_string(), "2026-03-02".to_string()]);
    }
}
