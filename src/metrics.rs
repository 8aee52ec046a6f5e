//! Read-only metrics derived from a raw item list.
//!
//! Everything here is a pure function of its inputs: no caching, no I/O, safe to
//! call speculatively from optimistic UI paths.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;

use crate::types::Item;
use crate::window::{WindowClassifier, WindowKey};

pub const DEFAULT_FAVORITE_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    pub streak_length: u32,
    pub favorite_category: Option<String>,
    pub window_count: u64,
}

impl DerivedMetrics {
    pub fn compute(
        items: &[Item],
        classifier: &WindowClassifier,
        now: DateTime<Utc>,
        favorite_window_days: u32,
    ) -> Self {
        Self {
            streak_length: streak_length(items, classifier, now),
            favorite_category: favorite_category(items, classifier, now, favorite_window_days),
            window_count: window_count(items, classifier, now),
        }
    }
}

/// Consecutive calendar days, ending today, that contain at least one item.
///
/// A day without items ends the streak, including today itself.
pub fn streak_length(items: &[Item], classifier: &WindowClassifier, now: DateTime<Utc>) -> u32 {
    let active_days: HashSet<NaiveDate> = items
        .iter()
        .map(|item| classifier.day_key(item.timestamp))
        .collect();

    let mut day = classifier.day_key(now);
    let mut streak = 0u32;
    while active_days.contains(&day) {
        streak += 1;
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => break,
        }
    }
    streak
}

/// Most frequent category among items from the last `window_days` calendar days
/// (today included). Ties go to the category encountered first.
pub fn favorite_category(
    items: &[Item],
    classifier: &WindowClassifier,
    now: DateTime<Utc>,
    window_days: u32,
) -> Option<String> {
    if window_days == 0 {
        return None;
    }
    let today = classifier.day_key(now);
    let first_day = today
        .checked_sub_days(Days::new(u64::from(window_days - 1)))
        .unwrap_or(NaiveDate::MIN);

    // Insertion-ordered tally so ties resolve to the earliest category.
    let mut tally: Vec<(&str, u32)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for item in items {
        let Some(category) = item.category_key() else {
            continue;
        };
        let day = classifier.day_key(item.timestamp);
        if day < first_day || day > today {
            continue;
        }
        match index.get(category) {
            Some(&slot) => tally[slot].1 += 1,
            None => {
                index.insert(category, tally.len());
                tally.push((category, 1));
            }
        }
    }

    let mut best: Option<(&str, u32)> = None;
    for &(category, count) in &tally {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((category, count));
        }
    }
    best.map(|(category, _)| category.to_string())
}

/// Items whose window is the window containing `now`.
pub fn window_count(items: &[Item], classifier: &WindowClassifier, now: DateTime<Utc>) -> u64 {
    let current = classifier.window_key(now);
    count_matching(
        items,
        classifier,
        &ItemFilter {
            window: Some(current),
            flag: None,
        },
    )
}

/// Criteria for [`count_matching`]; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub window: Option<WindowKey>,
    pub flag: Option<String>,
}

pub fn count_matching(items: &[Item], classifier: &WindowClassifier, filter: &ItemFilter) -> u64 {
    items
        .iter()
        .filter(|item| {
            filter
                .window
                .is_none_or(|key| classifier.window_key(item.timestamp) == key)
        })
        .filter(|item| filter.flag.as_deref().is_none_or(|flag| item.has_flag(flag)))
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};
    use chrono_tz::Tz;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn item(id: &str, ts: DateTime<Utc>, category: Option<&str>) -> Item {
        let item = Item::new(id, ts);
        match category {
            Some(c) => item.with_category(c),
            None => item,
        }
    }

    #[test]
    fn streak_counts_back_from_today() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 10, 18);
        let items = vec![
            item("a", at(2025, 4, 10, 8), None),
            item("b", at(2025, 4, 9, 8), None),
            item("c", at(2025, 4, 8, 23), None),
            item("d", at(2025, 4, 8, 1), None),
        ];
        assert_eq!(streak_length(&items, &classifier, now), 3);
    }

    #[test]
    fn streak_stops_at_first_gap() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 10, 18);
        let items = vec![
            item("a", at(2025, 4, 10, 8), None),
            item("c", at(2025, 4, 8, 8), None),
        ];
        assert_eq!(streak_length(&items, &classifier, now), 1);
    }

    #[test]
    fn streak_is_zero_without_an_item_today() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 10, 18);
        let items = vec![item("a", at(2025, 4, 9, 8), None)];
        assert_eq!(streak_length(&items, &classifier, now), 0);
        assert_eq!(streak_length(&[], &classifier, now), 0);
    }

    #[test]
    fn streak_uses_reference_timezone_days() {
        let tokyo: Tz = "Asia/Tokyo".parse().unwrap();
        let classifier = WindowClassifier::new(Weekday::Mon, tokyo);
        // 20:00 UTC on the 9th is the morning of the 10th in Tokyo.
        let now = at(2025, 4, 10, 3);
        let items = vec![
            item("a", at(2025, 4, 9, 20), None),
            item("b", at(2025, 4, 9, 1), None),
        ];
        assert_eq!(streak_length(&items, &classifier, now), 2);
    }

    #[test]
    fn favorite_picks_highest_count_in_trailing_window() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 30, 12);
        let items = vec![
            item("1", at(2025, 4, 29, 9), Some("Seneca")),
            item("2", at(2025, 4, 20, 9), Some("Aurelius")),
            item("3", at(2025, 4, 21, 9), Some("Aurelius")),
            // Too old to count, would otherwise make Seneca win.
            item("4", at(2025, 3, 1, 9), Some("Seneca")),
            item("5", at(2025, 3, 2, 9), Some("Seneca")),
            item("6", at(2025, 4, 22, 9), None),
        ];
        assert_eq!(
            favorite_category(&items, &classifier, now, 30).as_deref(),
            Some("Aurelius")
        );
    }

    #[test]
    fn favorite_ties_go_to_first_encountered() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 30, 12);
        let items = vec![
            item("1", at(2025, 4, 28, 9), Some("Epictetus")),
            item("2", at(2025, 4, 27, 9), Some("Seneca")),
            item("3", at(2025, 4, 26, 9), Some("Seneca")),
            item("4", at(2025, 4, 25, 9), Some("Epictetus")),
        ];
        assert_eq!(
            favorite_category(&items, &classifier, now, 30).as_deref(),
            Some("Epictetus")
        );
    }

    #[test]
    fn favorite_is_none_without_categorized_items_in_range() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 30, 12);
        let items = vec![
            item("1", at(2025, 4, 28, 9), None),
            item("2", at(2025, 4, 27, 9), Some("   ")),
            item("3", at(2025, 1, 2, 9), Some("Seneca")),
        ];
        assert_eq!(favorite_category(&items, &classifier, now, 30), None);
        assert_eq!(favorite_category(&items, &classifier, now, 0), None);
    }

    #[test]
    fn window_count_only_counts_current_window() {
        let classifier = WindowClassifier::default();
        // Wednesday; the window started Monday 2025-04-28.
        let now = at(2025, 4, 30, 12);
        let items = vec![
            item("1", at(2025, 4, 28, 0), None),
            item("2", at(2025, 4, 30, 11), None),
            item("3", at(2025, 4, 27, 23), None),
        ];
        assert_eq!(window_count(&items, &classifier, now), 2);
    }

    #[test]
    fn count_matching_combines_window_and_flag() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 30, 12);
        let items = vec![
            item("1", at(2025, 4, 29, 9), None).with_flag("favorite"),
            item("2", at(2025, 4, 29, 10), None),
            item("3", at(2025, 4, 1, 9), None).with_flag("favorite"),
        ];
        let flagged = ItemFilter {
            window: None,
            flag: Some("favorite".to_string()),
        };
        assert_eq!(count_matching(&items, &classifier, &flagged), 2);

        let flagged_this_week = ItemFilter {
            window: Some(classifier.window_key(now)),
            ..flagged
        };
        assert_eq!(count_matching(&items, &classifier, &flagged_this_week), 1);
        assert_eq!(count_matching(&items, &classifier, &ItemFilter::default()), 3);
    }

    #[test]
    fn compute_bundles_all_three() {
        let classifier = WindowClassifier::default();
        let now = at(2025, 4, 30, 12);
        let items = vec![
            item("1", at(2025, 4, 30, 9), Some("Seneca")),
            item("2", at(2025, 4, 29, 9), Some("Seneca")),
            item("3", at(2025, 4, 20, 9), Some("Aurelius")),
        ];
        let derived = DerivedMetrics::compute(&items, &classifier, now, 30);
        assert_eq!(derived.streak_length, 2);
        assert_eq!(derived.favorite_category.as_deref(), Some("Seneca"));
        assert_eq!(derived.window_count, 2);
    }
}
