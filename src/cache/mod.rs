//! Read-through cache with TTL expiry and in-flight request sharing.
//!
//! Concurrent callers asking for the same key while a load is outstanding all
//! await one shared upstream call. Successful results are stored with the time
//! they landed; a failed load stores nothing and reaches every waiting caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, SyncError};

type SharedLoad<V> = Shared<BoxFuture<'static, Result<V>>>;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> CacheEntry<V> {
    #[inline]
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

struct InFlight<V> {
    id: u64,
    load: SharedLoad<V>,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    /// Bumped by `invalidate_all`; loads started under an older generation are
    /// delivered to their callers but never stored.
    generation: u64,
    next_load_id: u64,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            generation: 0,
            next_load_id: 0,
        }
    }
}

pub struct ReadThroughCache<V> {
    state: Arc<Mutex<CacheState<V>>>,
}

impl<V> Default for ReadThroughCache<V> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }
}

impl<V> ReadThroughCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous hit path: the cached value if it is younger than `ttl`.
    pub fn peek(&self, key: &str, ttl: Duration) -> Option<V> {
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh(Instant::now(), ttl))
            .map(|entry| entry.value.clone())
    }

    /// Return the cached value for `key`, joining or starting an upstream load
    /// when there is none younger than `ttl`.
    ///
    /// `loader` is invoked at most once per load, and only if no other caller
    /// already has a load for `key` outstanding.
    pub async fn get<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let load = {
            let mut state = self.state.lock();
            let now = Instant::now();

            if let Some(entry) = state.entries.get(key)
                && entry.is_fresh(now, ttl)
            {
                debug!(key, "cache hit");
                return Ok(entry.value.clone());
            }
            // Expired entries are treated as absent.
            state.entries.remove(key);

            if let Some(in_flight) = state.in_flight.get(key) {
                debug!(key, "joining in-flight load");
                in_flight.load.clone()
            } else {
                let id = state.next_load_id;
                state.next_load_id += 1;
                let generation = state.generation;
                debug!(key, id, generation, "starting upstream load");

                let load = Self::settle(
                    Arc::clone(&self.state),
                    key.to_owned(),
                    id,
                    generation,
                    loader,
                )
                .boxed()
                .shared();
                state.in_flight.insert(
                    key.to_owned(),
                    InFlight {
                        id,
                        load: load.clone(),
                    },
                );
                load
            }
        };

        load.await
    }

    /// Runs the loader, then clears this load's in-flight marker and stores the
    /// value if nothing invalidated the cache meanwhile.
    async fn settle<F, Fut>(
        state: Arc<Mutex<CacheState<V>>>,
        key: String,
        id: u64,
        generation: u64,
        loader: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let result = loader().await.map_err(SyncError::upstream);

        let mut state = state.lock();
        if state.in_flight.get(&key).is_some_and(|f| f.id == id) {
            state.in_flight.remove(&key);
        }

        match &result {
            Ok(value) if state.generation == generation => {
                state.entries.insert(
                    key,
                    CacheEntry {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
            Ok(_) => debug!(%key, "cache invalidated during load; result not stored"),
            Err(err) => debug!(%key, error = %err, "upstream load failed"),
        }

        result
    }

    /// Drop cached values for `keys`. Outstanding loads are left alone.
    pub fn invalidate<K: AsRef<str>>(&self, keys: &[K]) {
        let mut state = self.state.lock();
        for key in keys {
            state.entries.remove(key.as_ref());
        }
    }

    /// Drop every cached value and forget every in-flight marker.
    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.in_flight.clear();
        state.generation += 1;
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
