//! Snapshot diffing keyed by stable listing id.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mept_core::{ChangeKind, ChangeRecord, ChangeReport, Listing, PriceChange};
use rust_decimal::Decimal;

fn index_by_id(listings: &[Listing]) -> BTreeMap<&str, &Listing> {
    let mut map = BTreeMap::new();
    for listing in listings {
        map.entry(listing.id.as_str()).or_insert(listing);
    }
    map
}

/// Classify every id in `current` against `previous`, plus every id that
/// disappeared. Unchanged records are included.
pub fn diff(previous: &[Listing], current: &[Listing]) -> Vec<ChangeRecord> {
    let prev = index_by_id(previous);
    let curr = index_by_id(current);
    let mut records = Vec::with_capacity(curr.len() + prev.len());

    for (id, listing) in &curr {
        let record = match prev.get(id) {
            None => ChangeRecord {
                kind: ChangeKind::New,
                id: id.to_string(),
                listing: (*listing).clone(),
                old_price: None,
                new_price: Some(listing.price),
                delta: None,
            },
            Some(old) => {
                let kind = match listing.price.cmp(&old.price) {
                    Ordering::Less => ChangeKind::Decreased,
                    Ordering::Greater => ChangeKind::Increased,
                    Ordering::Equal => ChangeKind::Unchanged,
                };
                let delta = (kind != ChangeKind::Unchanged).then(|| (listing.price - old.price).abs());
                ChangeRecord {
                    kind,
                    id: id.to_string(),
                    listing: (*listing).clone(),
                    old_price: Some(old.price),
                    new_price: Some(listing.price),
                    delta,
                }
            }
        };
        records.push(record);
    }

    for (id, old) in &prev {
        if !curr.contains_key(id) {
            records.push(ChangeRecord {
                kind: ChangeKind::Removed,
                id: id.to_string(),
                listing: (*old).clone(),
                old_price: Some(old.price),
                new_price: None,
                delta: None,
            });
        }
    }

    sort_records(&mut records);
    records
}

/// Kind, then largest delta first, then id.
pub fn sort_records(records: &mut [ChangeRecord]) {
    records.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| {
                b.delta
                    .unwrap_or(Decimal::ZERO)
                    .cmp(&a.delta.unwrap_or(Decimal::ZERO))
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn price_change(record: &ChangeRecord) -> Option<PriceChange> {
    Some(PriceChange {
        listing: record.listing.clone(),
        old_price: record.old_price?,
        new_price: record.new_price?,
        delta: record.delta?,
    })
}

/// Fold sorted records into the consumer-facing report. Unchanged records
/// only contribute a count.
pub fn build_report(records: &[ChangeRecord], generated_at: DateTime<Utc>) -> ChangeReport {
    let mut report = ChangeReport {
        generated_at,
        new: Vec::new(),
        removed: Vec::new(),
        increased: Vec::new(),
        decreased: Vec::new(),
        unchanged_count: 0,
    };
    for record in records {
        match record.kind {
            ChangeKind::New => report.new.push(record.listing.clone()),
            ChangeKind::Removed => report.removed.push(record.listing.clone()),
            ChangeKind::Increased => report.increased.extend(price_change(record)),
            ChangeKind::Decreased => report.decreased.extend(price_change(record)),
            ChangeKind::Unchanged => report.unchanged_count += 1,
        }
    }
    report
}
