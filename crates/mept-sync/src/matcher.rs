//! Cross-store product clustering by extracted match key.

use std::collections::{BTreeMap, BTreeSet};

use mept_core::{EngineConfig, Listing, MatchCluster};
use strsim::jaro_winkler;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub clusters: Vec<MatchCluster>,
    /// Listings with no model key; never clustered.
    pub without_model_key: usize,
    /// Listings with a model key whose group did not reach the store threshold.
    pub unclustered_with_model_key: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    min_distinct_stores: usize,
    review_threshold: f64,
}

impl Matcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            min_distinct_stores: config.effective_min_cluster_stores(),
            review_threshold: config.review_threshold,
        }
    }

    /// Single pass grouping by `modelKey_storage`. Groups spanning fewer than
    /// the minimum number of distinct stores are discarded.
    pub fn match_listings(&self, listings: &[Listing]) -> MatchOutcome {
        let mut groups: BTreeMap<String, Vec<&Listing>> = BTreeMap::new();
        let mut without_model_key = 0usize;
        for listing in listings {
            match listing.spec.match_key() {
                Some(key) => groups.entry(key).or_default().push(listing),
                None => without_model_key += 1,
            }
        }

        let mut clusters = Vec::new();
        let mut unclustered_with_model_key = 0usize;
        for (match_key, mut members) in groups {
            let stores: BTreeSet<&str> = members.iter().map(|l| l.store.as_str()).collect();
            if stores.len() < self.min_distinct_stores {
                unclustered_with_model_key += members.len();
                continue;
            }
            members.sort_by(|a, b| {
                a.price
                    .cmp(&b.price)
                    .then_with(|| a.store.cmp(&b.store))
                    .then_with(|| a.id.cmp(&b.id))
            });
            let confidence = name_confidence(&members);
            clusters.push(MatchCluster {
                match_key,
                listings: members.into_iter().cloned().collect(),
                confidence,
                review_required: confidence < self.review_threshold,
            });
        }

        MatchOutcome {
            clusters,
            without_model_key,
            unclustered_with_model_key,
        }
    }
}

/// Lowest Jaro-Winkler similarity between canonical names of members from
/// different stores. 1.0 when no such pair exists.
pub fn name_confidence(members: &[&Listing]) -> f64 {
    let mut lowest: f64 = 1.0;
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            if a.store != b.store {
                lowest = lowest.min(jaro_winkler(&a.canonical_name, &b.canonical_name));
            }
        }
    }
    lowest
}

pub fn match_listings(listings: &[Listing], config: &EngineConfig) -> Vec<MatchCluster> {
    Matcher::new(config).match_listings(listings).clusters
}
