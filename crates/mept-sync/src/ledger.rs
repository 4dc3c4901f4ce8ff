//! Daily aggregate ledger with bounded retention.

use chrono::{Days, NaiveDate};
use mept_core::{History, HistoryEntry, HISTORY_DATE_FORMAT};

pub fn date_key(date: NaiveDate) -> String {
    date.format(HISTORY_DATE_FORMAT).to_string()
}

pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, HISTORY_DATE_FORMAT).ok()
}

/// Insert or overwrite the entry for `date`. Only the last write of a day survives.
pub fn record(mut history: History, date: NaiveDate, entry: HistoryEntry) -> History {
    history.insert(date_key(date), entry);
    history
}

/// Keep entries dated on or after `today - retention_days`. Keys that are not
/// calendar dates are dropped. A window reaching past the earliest
/// representable date keeps every dated entry.
pub fn prune(history: History, retention_days: u32, today: NaiveDate) -> History {
    let cutoff = today.checked_sub_days(Days::new(u64::from(retention_days)));
    history
        .into_iter()
        .filter(|(key, _)| {
            parse_date_key(key).is_some_and(|date| cutoff.map_or(true, |cutoff| date >= cutoff))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn entry(count: usize) -> HistoryEntry {
        HistoryEntry {
            listing_count: count,
            ..HistoryEntry::default()
        }
    }

    #[test]
    fn same_day_record_overwrites() {
        let history = record(History::new(), day(2026, 3, 1), entry(10));
        let history = record(history, day(2026, 3, 1), entry(12));
        assert_eq!(history.len(), 1);
        assert_eq!(history["2026-03-01"].listing_count, 12);
    }

    #[test]
    fn retention_boundary_is_inclusive() {
        let today = day(2026, 3, 31);
        let mut history = History::new();
        history = record(history, day(2026, 3, 1), entry(1));
        history = record(history, day(2026, 2, 28), entry(2));
        history = record(history, today, entry(3));

        let pruned = prune(history, 30, today);
        assert!(pruned.contains_key("2026-03-01"));
        assert!(!pruned.contains_key("2026-02-28"));
        assert!(pruned.contains_key("2026-03-31"));
    }

    #[test]
    fn prune_is_idempotent() {
        let today = day(2026, 3, 31);
        let history: History = (1..=60)
            .map(|offset| (date_key(today - Duration::days(offset)), entry(offset as usize)))
            .collect();
        let once = prune(history, 30, today);
        let twice = prune(once.clone(), 30, today);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 30);
    }

    #[test]
    fn huge_retention_window_keeps_everything() {
        let today = day(2026, 3, 31);
        let history = record(History::new(), day(1999, 1, 1), entry(1));
        let history = record(history, today, entry(2));
        let pruned = prune(history.clone(), u32::MAX, today);
        assert_eq!(pruned, history);
    }

    #[test]
    fn non_date_keys_are_discarded() {
        let mut history = History::new();
        history.insert("1709272800000".to_string(), entry(5));
        history = record(history, day(2026, 3, 1), entry(6));
        let pruned = prune(history, 30, day(2026, 3, 2));
        assert_eq!(pruned.keys().collect::<Vec<_>>(), vec!["2026-03-01"]);
    }
}
