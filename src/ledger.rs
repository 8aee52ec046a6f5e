//! Baseline+delta bookkeeping for count-type aggregates.
//!
//! Each ledger keeps the last authoritative counts (the baseline) plus local
//! mutations the server has not confirmed yet. The displayed value is always
//! `baseline + pending adds - pending deletes`, never clamped against any other
//! computation. Reconciliation shrinks the pending counters by however much a new
//! baseline moved, so repeated refresh cycles cannot make them drift.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{AggregateSnapshot, DeleteMode, Item};
use crate::window::{Clock, WindowClassifier, WindowKey};

/// Unconfirmed local mutations since the last baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub adds: u64,
    pub deletes: u64,
    pub window_adds: u64,
    pub window_deletes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateLedger {
    baseline_total: u64,
    baseline_window: u64,
    pending: PendingCounts,
    /// Window the window-scoped counters belong to; `None` until first use.
    window: Option<WindowKey>,
    has_baseline: bool,
}

impl AggregateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_local_add(
        &mut self,
        item: &Item,
        classifier: &WindowClassifier,
        now: DateTime<Utc>,
    ) {
        let current = classifier.window_key(now);
        self.roll_window(current);

        self.pending.adds = self.pending.adds.saturating_add(1);
        if classifier.window_key(item.timestamp) == current {
            self.pending.window_adds = self.pending.window_adds.saturating_add(1);
        }
    }

    pub fn apply_local_delete(
        &mut self,
        item: &Item,
        mode: DeleteMode,
        classifier: &WindowClassifier,
        now: DateTime<Utc>,
    ) {
        let current = classifier.window_key(now);
        self.roll_window(current);
        let in_window = classifier.window_key(item.timestamp) == current;

        match mode {
            DeleteMode::Optimistic => {
                self.pending.deletes = self.pending.deletes.saturating_add(1);
                if in_window {
                    self.pending.window_deletes = self.pending.window_deletes.saturating_add(1);
                }
            }
            DeleteMode::Reverted => {
                self.pending.deletes = self.pending.deletes.saturating_sub(1);
                if in_window {
                    self.pending.window_deletes = self.pending.window_deletes.saturating_sub(1);
                }
            }
            // The next authoritative baseline already reflects it.
            DeleteMode::Confirmed => {}
        }
    }

    pub fn effective_total(&self) -> u64 {
        self.baseline_total
            .saturating_add(self.pending.adds)
            .saturating_sub(self.pending.deletes)
    }

    pub fn effective_window(&self) -> u64 {
        self.baseline_window
            .saturating_add(self.pending.window_adds)
            .saturating_sub(self.pending.window_deletes)
    }

    /// Fold a fresh authoritative baseline in.
    ///
    /// A baseline that grew has absorbed that many local adds; one that shrank
    /// has absorbed that many local deletes. The window pair is handled the same
    /// way. Calling this twice with the same values is a no-op the second time.
    pub fn reconcile(&mut self, new_total: u64, new_window: u64) {
        absorb(
            &mut self.pending.adds,
            &mut self.pending.deletes,
            self.baseline_total,
            new_total,
        );
        absorb(
            &mut self.pending.window_adds,
            &mut self.pending.window_deletes,
            self.baseline_window,
            new_window,
        );
        self.baseline_total = new_total;
        self.baseline_window = new_window;
        self.has_baseline = true;
    }

    /// Move the window-scoped counters onto `current`.
    ///
    /// When the calendar rolls into a new window, the previous window's baseline
    /// and pending counts no longer describe the current one and are zeroed.
    pub fn roll_window(&mut self, current: WindowKey) {
        match self.window {
            Some(key) if key == current => {}
            Some(_) => {
                self.baseline_window = 0;
                self.pending.window_adds = 0;
                self.pending.window_deletes = 0;
                self.window = Some(current);
            }
            None => self.window = Some(current),
        }
    }

    pub fn baseline_total(&self) -> u64 {
        self.baseline_total
    }

    pub fn baseline_window(&self) -> u64 {
        self.baseline_window
    }

    pub fn pending(&self) -> PendingCounts {
        self.pending
    }

    pub fn has_baseline(&self) -> bool {
        self.has_baseline
    }
}

fn absorb(pending_adds: &mut u64, pending_deletes: &mut u64, old: u64, new: u64) {
    if new > old {
        *pending_adds = pending_adds.saturating_sub(new - old);
    } else if new < old {
        *pending_deletes = pending_deletes.saturating_sub(old - new);
    }
}

/// Ledgers for every metric family, created lazily on first access.
pub struct LedgerBook {
    ledgers: DashMap<Arc<str>, AggregateLedger>,
    classifier: WindowClassifier,
    clock: Arc<dyn Clock>,
}

impl LedgerBook {
    pub fn new(classifier: WindowClassifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledgers: DashMap::new(),
            classifier,
            clock,
        }
    }

    fn with_ledger<R>(&self, family: &str, f: impl FnOnce(&mut AggregateLedger) -> R) -> R {
        let mut entry = self.ledgers.entry(Arc::from(family)).or_default();
        f(entry.value_mut())
    }

    pub fn apply_local_add(&self, family: &str, item: &Item) {
        let now = self.clock.now();
        self.with_ledger(family, |ledger| {
            ledger.apply_local_add(item, &self.classifier, now)
        });
    }

    pub fn apply_local_delete(&self, family: &str, item: &Item, mode: DeleteMode) {
        let now = self.clock.now();
        self.with_ledger(family, |ledger| {
            ledger.apply_local_delete(item, mode, &self.classifier, now)
        });
    }

    /// Install `snapshot` as the new baseline for `family`.
    ///
    /// The snapshot's window count is attributed to the window containing now.
    pub fn reconcile(&self, family: &str, snapshot: AggregateSnapshot) {
        let current = self.classifier.window_key(self.clock.now());
        self.with_ledger(family, |ledger| {
            ledger.roll_window(current);
            ledger.reconcile(snapshot.total_count, snapshot.window_count);
        });
    }

    /// `(effective_total, effective_window)` for `family`.
    pub fn effective(&self, family: &str) -> (u64, u64) {
        let current = self.classifier.window_key(self.clock.now());
        self.with_ledger(family, |ledger| {
            ledger.roll_window(current);
            (ledger.effective_total(), ledger.effective_window())
        })
    }

    pub fn ledger(&self, family: &str) -> AggregateLedger {
        self.with_ledger(family, |ledger| ledger.clone())
    }

    pub fn clear(&self) {
        self.ledgers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::FixedClock;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    // Wednesday; the current window started Monday 2025-06-09.
    fn now() -> DateTime<Utc> {
        at(2025, 6, 11, 12)
    }

    fn this_week(id: &str) -> Item {
        Item::new(id, at(2025, 6, 10, 9))
    }

    fn last_week(id: &str) -> Item {
        Item::new(id, at(2025, 6, 4, 9))
    }

    fn seeded(total: u64, window: u64) -> AggregateLedger {
        let mut ledger = AggregateLedger::new();
        ledger.roll_window(WindowClassifier::default().window_key(now()));
        ledger.reconcile(total, window);
        ledger
    }

    #[test]
    fn add_is_visible_immediately() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);

        ledger.apply_local_add(&this_week("a"), &classifier, now());

        assert_eq!(ledger.effective_total(), 11);
        assert_eq!(ledger.effective_window(), 4);
        assert_eq!(
            ledger.pending(),
            PendingCounts {
                adds: 1,
                window_adds: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn add_outside_current_window_skips_window_counter() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);

        ledger.apply_local_add(&last_week("old"), &classifier, now());

        assert_eq!(ledger.pending().adds, 1);
        assert_eq!(ledger.pending().window_adds, 0);
        assert_eq!(ledger.effective_total(), 11);
        assert_eq!(ledger.effective_window(), 3);
    }

    #[test]
    fn optimistic_then_reverted_restores_counters() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);
        ledger.apply_local_add(&this_week("a"), &classifier, now());
        let before = ledger.pending();

        let item = this_week("b");
        ledger.apply_local_delete(&item, DeleteMode::Optimistic, &classifier, now());
        assert_eq!(ledger.effective_total(), 10);
        assert_eq!(ledger.effective_window(), 3);

        ledger.apply_local_delete(&item, DeleteMode::Reverted, &classifier, now());
        assert_eq!(ledger.pending(), before);
    }

    #[test]
    fn reverted_without_pending_delete_floors_at_zero() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(5, 1);
        ledger.apply_local_delete(&this_week("x"), DeleteMode::Reverted, &classifier, now());
        assert_eq!(ledger.pending(), PendingCounts::default());
        assert_eq!(ledger.effective_total(), 5);
    }

    #[test]
    fn confirmed_delete_leaves_counters_alone() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);
        ledger.apply_local_delete(&this_week("x"), DeleteMode::Confirmed, &classifier, now());
        assert_eq!(ledger.pending(), PendingCounts::default());
        assert_eq!(ledger.effective_total(), 10);
    }

    #[test]
    fn effective_values_never_go_negative() {
        let classifier = WindowClassifier::default();
        let mut ledger = AggregateLedger::new();
        for i in 0..5 {
            let item = this_week(&i.to_string());
            ledger.apply_local_delete(&item, DeleteMode::Optimistic, &classifier, now());
            assert_eq!(ledger.effective_total(), 0);
            assert_eq!(ledger.effective_window(), 0);
        }
        ledger.apply_local_add(&this_week("a"), &classifier, now());
        ledger.apply_local_add(&last_week("b"), &classifier, now());
        assert_eq!(ledger.effective_total(), 0);
        assert_eq!(ledger.effective_window(), 0);
    }

    #[test]
    fn reconcile_absorbs_confirmed_adds() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);
        for i in 0..4 {
            ledger.apply_local_add(&this_week(&i.to_string()), &classifier, now());
        }
        assert_eq!(ledger.effective_total(), 14);

        ledger.reconcile(14, 7);

        assert_eq!(ledger.pending(), PendingCounts::default());
        assert_eq!(ledger.effective_total(), 14);
        assert_eq!(ledger.effective_window(), 7);
    }

    #[test]
    fn reconcile_partially_absorbs_when_server_lags() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);
        for i in 0..3 {
            ledger.apply_local_add(&this_week(&i.to_string()), &classifier, now());
        }

        // Server has only seen one of the three adds so far.
        ledger.reconcile(11, 4);

        assert_eq!(ledger.pending().adds, 2);
        assert_eq!(ledger.pending().window_adds, 2);
        assert_eq!(ledger.effective_total(), 13);
        assert_eq!(ledger.effective_window(), 6);
    }

    #[test]
    fn reconcile_absorbs_confirmed_deletes() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);
        let item = this_week("gone");
        ledger.apply_local_delete(&item, DeleteMode::Optimistic, &classifier, now());
        assert_eq!(ledger.effective_total(), 9);

        ledger.reconcile(9, 2);

        assert_eq!(ledger.pending(), PendingCounts::default());
        assert_eq!(ledger.effective_total(), 9);
        assert_eq!(ledger.effective_window(), 2);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);
        ledger.apply_local_add(&this_week("a"), &classifier, now());
        ledger.apply_local_add(&this_week("b"), &classifier, now());

        ledger.reconcile(11, 4);
        let after_first = ledger.clone();
        ledger.reconcile(11, 4);

        assert_eq!(ledger, after_first);
        assert_eq!(ledger.effective_total(), 12);
    }

    #[test]
    fn unrelated_baseline_growth_does_not_underflow() {
        let mut ledger = seeded(10, 3);
        // Another client added items; nothing pending locally.
        ledger.reconcile(25, 8);
        assert_eq!(ledger.pending(), PendingCounts::default());
        assert_eq!(ledger.effective_total(), 25);
        assert!(ledger.has_baseline());
    }

    #[test]
    fn rolling_into_a_new_window_resets_window_counters() {
        let classifier = WindowClassifier::default();
        let mut ledger = seeded(10, 3);
        ledger.apply_local_add(&this_week("a"), &classifier, now());

        let next_monday = at(2025, 6, 16, 8);
        ledger.roll_window(classifier.window_key(next_monday));

        assert_eq!(ledger.effective_window(), 0);
        assert_eq!(ledger.pending().window_adds, 0);
        assert_eq!(ledger.effective_total(), 11);
    }

    #[test]
    fn book_creates_ledgers_lazily_per_family() {
        let clock = Arc::new(FixedClock::new(now()));
        let book = LedgerBook::new(WindowClassifier::default(), clock.clone());

        assert_eq!(book.effective("quotes"), (0, 0));
        assert!(!book.ledger("quotes").has_baseline());

        book.reconcile(
            "quotes",
            AggregateSnapshot {
                total_count: 10,
                window_count: 2,
            },
        );
        book.apply_local_add("quotes", &this_week("q"));
        book.apply_local_add("journal", &this_week("j"));

        assert_eq!(book.effective("quotes"), (11, 3));
        assert_eq!(book.effective("journal"), (1, 1));

        book.clear();
        assert_eq!(book.effective("quotes"), (0, 0));
    }

    #[test]
    fn book_rolls_window_when_clock_crosses_boundary() {
        let clock = Arc::new(FixedClock::new(now()));
        let book = LedgerBook::new(WindowClassifier::default(), clock.clone());
        book.reconcile(
            "quotes",
            AggregateSnapshot {
                total_count: 10,
                window_count: 4,
            },
        );
        book.apply_local_add("quotes", &this_week("q"));
        assert_eq!(book.effective("quotes"), (11, 5));

        clock.set(at(2025, 6, 16, 8));
        assert_eq!(book.effective("quotes"), (11, 0));

        // First snapshot of the new window: the pending add from last week is not
        // counted against it.
        book.reconcile(
            "quotes",
            AggregateSnapshot {
                total_count: 11,
                window_count: 0,
            },
        );
        assert_eq!(book.effective("quotes"), (11, 0));
        assert_eq!(book.ledger("quotes").pending(), PendingCounts::default());
    }
}
