//! Optimistic aggregate stats.
//!
//! A [`StatsService`] keeps user-visible counts (total, current window, streak,
//! favorite category) instantly consistent with local mutations while an
//! authoritative backend catches up. Reads go through a TTL cache with
//! in-flight request sharing; local adds and deletes land in a baseline+delta
//! ledger and are absorbed when the backend reports them.

pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod reqwest_simd_json;
pub mod service;
pub mod types;
pub mod utils;
pub mod window;

pub use cache::ReadThroughCache;
pub use error::{Result, SyncError};
pub use ledger::{AggregateLedger, LedgerBook, PendingCounts};
pub use metrics::{DerivedMetrics, ItemFilter};
pub use provider::{HttpItemProvider, ItemProvider};
pub use service::{EngineSettings, StatsService, SubscriptionId};
pub use types::{
    AggregateSnapshot, DeleteMode, EffectiveStats, Item, MutationEvent, MutationKind, Scope,
};
pub use window::{Clock, FixedClock, SystemClock, WindowClassifier, WindowKey};
