//! The stats service: the one object the presentation layer talks to.
//!
//! Mutation signals update the ledger synchronously, push the new effective
//! values to subscribers in the same call, then invalidate cached aggregates and
//! schedule a silent background refresh whose authoritative answer is reconciled
//! back into the ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Weekday;
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ReadThroughCache;
use crate::error::{Result, SyncError};
use crate::ledger::{AggregateLedger, LedgerBook};
use crate::metrics::{DEFAULT_FAVORITE_WINDOW_DAYS, DerivedMetrics};
use crate::provider::ItemProvider;
use crate::types::{AggregateSnapshot, EffectiveStats, Item, MutationEvent, Scope};
use crate::window::{Clock, SystemClock, WindowClassifier};

/// Options consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Freshness window for fast-changing aggregates (the count snapshot).
    pub ttl_short: Duration,
    /// Freshness window for slower aggregates (the item list).
    pub ttl_default: Duration,
    /// Day of week that starts a window.
    pub window_anchor: Weekday,
    /// Reference timezone for calendar days.
    pub timezone: Tz,
    /// Metric family the ledger tracks.
    pub family: String,
    pub favorite_window_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ttl_short: Duration::from_secs(15),
            ttl_default: Duration::from_secs(30),
            window_anchor: Weekday::Mon,
            timezone: Tz::UTC,
            family: "quotes".to_string(),
            favorite_window_days: DEFAULT_FAVORITE_WINDOW_DAYS,
        }
    }
}

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&EffectiveStats) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: SubscriptionId,
    callbacks: Vec<(SubscriptionId, Callback)>,
}

struct ServiceInner {
    settings: EngineSettings,
    provider: Arc<dyn ItemProvider>,
    clock: Arc<dyn Clock>,
    classifier: WindowClassifier,
    ledgers: LedgerBook,
    snapshots: ReadThroughCache<AggregateSnapshot>,
    items: ReadThroughCache<Arc<Vec<Item>>>,
    scope: RwLock<Option<Scope>>,
    derived: RwLock<DerivedMetrics>,
    loading: AtomicBool,
    /// Held for the whole of a refresh so at most one is fetching at a time.
    refresh_gate: tokio::sync::Mutex<()>,
    subscribers: Mutex<Subscribers>,
    updates: watch::Sender<EffectiveStats>,
}

/// Explicitly constructed, cheaply cloneable handle to one stats engine.
#[derive(Clone)]
pub struct StatsService {
    inner: Arc<ServiceInner>,
}

impl StatsService {
    pub fn new(settings: EngineSettings, provider: Arc<dyn ItemProvider>) -> Self {
        Self::with_clock(settings, provider, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: EngineSettings,
        provider: Arc<dyn ItemProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let classifier = WindowClassifier::new(settings.window_anchor, settings.timezone);
        let (updates, _) = watch::channel(EffectiveStats::default());
        Self {
            inner: Arc::new(ServiceInner {
                ledgers: LedgerBook::new(classifier, Arc::clone(&clock)),
                settings,
                provider,
                clock,
                classifier,
                snapshots: ReadThroughCache::new(),
                items: ReadThroughCache::new(),
                scope: RwLock::new(None),
                derived: RwLock::new(DerivedMetrics::default()),
                loading: AtomicBool::new(false),
                refresh_gate: tokio::sync::Mutex::new(()),
                subscribers: Mutex::new(Subscribers::default()),
                updates,
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn classifier(&self) -> &WindowClassifier {
        &self.inner.classifier
    }

    // --- Session lifecycle ---

    /// Begin tracking `scope`. Any state from a previous session is dropped.
    pub fn start_session(&self, scope: Scope) {
        info!(%scope, "starting stats session");
        self.reset_state();
        *self.inner.scope.write() = Some(scope);
        self.broadcast();
    }

    /// Stop tracking and forget every baseline, pending delta and cached value.
    pub fn end_session(&self) {
        if let Some(scope) = self.inner.scope.write().take() {
            info!(%scope, "ending stats session");
        }
        self.reset_state();
        self.broadcast();
    }

    fn reset_state(&self) {
        self.inner.ledgers.clear();
        self.invalidate_all();
        *self.inner.derived.write() = DerivedMetrics::default();
        self.inner.loading.store(false, Ordering::SeqCst);
    }

    pub fn scope(&self) -> Option<Scope> {
        self.inner.scope.read().clone()
    }

    fn require_scope(&self) -> Result<Scope> {
        self.scope().ok_or(SyncError::MissingScope)
    }

    // --- Reads ---

    /// Current displayed values. Never waits on the network.
    pub fn effective_stats(&self) -> EffectiveStats {
        let (total_count, window_count) = self.inner.ledgers.effective(&self.inner.settings.family);
        let derived = self.inner.derived.read();
        EffectiveStats {
            total_count,
            window_count,
            streak_length: derived.streak_length,
            favorite_category: derived.favorite_category.clone(),
            loading: self.inner.loading.load(Ordering::SeqCst),
        }
    }

    /// Copy of the tracked family's ledger, for diagnostics.
    pub fn ledger(&self) -> AggregateLedger {
        self.inner.ledgers.ledger(&self.inner.settings.family)
    }

    pub fn derived_metrics(&self) -> DerivedMetrics {
        self.inner.derived.read().clone()
    }

    // --- Subscriptions ---

    /// Register `callback`; it runs synchronously on every change of the
    /// effective values.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&EffectiveStats) + Send + Sync + 'static,
    {
        let mut subscribers = self.inner.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.push((id, Arc::new(callback)));
        id
    }

    /// Returns whether `id` was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.callbacks.len();
        subscribers.callbacks.retain(|(existing, _)| *existing != id);
        subscribers.callbacks.len() != before
    }

    /// Receiver that always holds the latest broadcast values.
    pub fn watch(&self) -> watch::Receiver<EffectiveStats> {
        self.inner.updates.subscribe()
    }

    fn broadcast(&self) {
        let stats = self.effective_stats();
        self.inner.updates.send_replace(stats.clone());

        // Snapshot the list so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .inner
            .subscribers
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&stats);
        }
    }

    // --- Mutation pipeline ---

    /// Entry point for "an item changed" signals.
    ///
    /// The ledger update and broadcast happen before this returns. The returned
    /// handle resolves when the scheduled silent refresh finishes; dropping it
    /// does not cancel the refresh.
    pub fn notify_mutation(&self, event: MutationEvent) -> Result<JoinHandle<()>> {
        self.require_scope()?;
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let family = self.inner.settings.family.as_str();

        match &event {
            MutationEvent::Added(item) => self.inner.ledgers.apply_local_add(family, item),
            MutationEvent::Deleted { item, mode } => {
                self.inner.ledgers.apply_local_delete(family, item, *mode)
            }
            MutationEvent::Edited { .. } => {}
        }
        debug!(
            kind = %event.kind(),
            item = %event.item().id,
            "applied local mutation"
        );

        if event.changes_cardinality() {
            self.broadcast();
        }
        self.invalidate_all();

        let service = self.clone();
        Ok(runtime.spawn(async move {
            if let Err(err) = service.refresh().await {
                warn!(error = %err, "silent refresh failed; keeping optimistic values");
            }
        }))
    }

    /// Drop every cached aggregate for this service.
    pub fn invalidate_all(&self) {
        self.inner.snapshots.invalidate_all();
        self.inner.items.invalidate_all();
    }

    // --- Refresh ---

    /// Initial, user-visible load: raises `loading` while it runs.
    ///
    /// Unlike the silent refresh, failures are returned to the caller.
    pub async fn load(&self) -> Result<EffectiveStats> {
        self.require_scope()?;
        self.inner.loading.store(true, Ordering::SeqCst);
        self.broadcast();

        let result = self.refresh().await;

        self.inner.loading.store(false, Ordering::SeqCst);
        self.broadcast();
        result.map(|_| self.effective_stats())
    }

    /// Fetch authoritative data through the cache and fold it in.
    ///
    /// Never touches the `loading` flag. A partial failure still applies the half
    /// that succeeded before the error is returned.
    ///
    /// Refreshes queue behind each other: one requested while another is
    /// fetching starts after it completes, so an older answer can never be
    /// reconciled over a newer one.
    pub async fn refresh(&self) -> Result<EffectiveStats> {
        let scope = self.require_scope()?;
        let _gate = self.inner.refresh_gate.lock().await;

        let (snapshot, items) = tokio::join!(self.fetch_snapshot(&scope), self.fetch_items(&scope));

        if self.scope().as_ref() != Some(&scope) {
            debug!(%scope, "session changed during refresh; discarding result");
            return Ok(self.effective_stats());
        }

        let mut changed = false;
        if let Ok(snapshot) = &snapshot {
            debug!(
                total = snapshot.total_count,
                window = snapshot.window_count,
                "reconciling authoritative snapshot"
            );
            self.inner
                .ledgers
                .reconcile(&self.inner.settings.family, *snapshot);
            changed = true;
        }
        if let Ok(items) = &items {
            let derived = DerivedMetrics::compute(
                items,
                &self.inner.classifier,
                self.inner.clock.now(),
                self.inner.settings.favorite_window_days,
            );
            *self.inner.derived.write() = derived;
            changed = true;
        }
        if changed {
            self.broadcast();
        }

        snapshot?;
        items?;
        Ok(self.effective_stats())
    }

    fn cache_key(&self, operation: &str, scope: &Scope) -> String {
        format!("{operation}:{}:{scope}", self.inner.settings.family)
    }

    async fn fetch_snapshot(&self, scope: &Scope) -> Result<AggregateSnapshot> {
        let key = self.cache_key("snapshot", scope);
        let provider = Arc::clone(&self.inner.provider);
        let scope = scope.clone();
        self.inner
            .snapshots
            .get(&key, self.inner.settings.ttl_short, move || async move {
                provider.fetch_aggregate_snapshot(&scope).await
            })
            .await
    }

    async fn fetch_items(&self, scope: &Scope) -> Result<Arc<Vec<Item>>> {
        let key = self.cache_key("items", scope);
        let provider = Arc::clone(&self.inner.provider);
        let scope = scope.clone();
        self.inner
            .items
            .get(&key, self.inner.settings.ttl_default, move || async move {
                provider.fetch_item_list(&scope).await.map(Arc::new)
            })
            .await
    }
}
