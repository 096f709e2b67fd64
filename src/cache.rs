//! Keyed TTL cache with in-flight load de-duplication.
//!
//! Concurrent `get_or_load` calls for the same missing key share one loader
//! invocation. Expiry is passive: entries are checked (and dropped) on read.

use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::clock::Clock;
use crate::model::Ms;
use crate::observability::{
    CACHE_HITS_TOTAL, CACHE_INFLIGHT_JOINS_TOTAL, CACHE_MISSES_TOTAL, CACHE_STALE_SERVED_TOTAL,
};

type InFlight<V> = Shared<BoxFuture<'static, V>>;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: Ms,
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Fresh(V),
    /// Past the TTL but inside the stale grace period.
    Stale(V),
    Miss,
}

pub struct CacheLayer<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for CacheLayer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    name: &'static str,
    entries: DashMap<K, CacheEntry<V>>,
    in_flight: DashMap<K, InFlight<V>>,
    ttl: Ms,
    stale_grace: Ms,
    admit: fn(&V) -> bool,
    clock: Arc<dyn Clock>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn lookup(&self, key: &K) -> Lookup<V> {
        let now = self.clock.now_ms();
        let found = self.entries.get(key).map(|e| {
            let age = now - e.stored_at;
            if age < self.ttl {
                Lookup::Fresh(e.value.clone())
            } else if age < self.ttl + self.stale_grace {
                Lookup::Stale(e.value.clone())
            } else {
                Lookup::Miss
            }
        });
        match found {
            Some(Lookup::Miss) => {
                self.entries
                    .remove_if(key, |_, e| now - e.stored_at >= self.ttl + self.stale_grace);
                Lookup::Miss
            }
            Some(hit) => hit,
            None => Lookup::Miss,
        }
    }

    fn store(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now_ms(),
        };
        self.entries.insert(key, entry);
    }
}

impl<K, V> CacheLayer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                ttl: ttl.as_millis() as Ms,
                stale_grace: 0,
                admit: |_| true,
                clock,
            }),
        }
    }

    /// Allow `get_or_refresh` to serve entries up to `grace` past their TTL.
    /// Must be called before the cache is shared.
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.stale_grace = grace.as_millis() as Ms;
        }
        self
    }

    /// Only loaded values passing `admit` are stored. Waiters still receive
    /// rejected values; the next caller after them loads again.
    pub fn with_admission(mut self, admit: fn(&V) -> bool) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.admit = admit;
        }
        self
    }

    /// Fresh value, or `None`. Never blocks.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.inner.lookup(key) {
            Lookup::Fresh(v) => Some(v),
            _ => None,
        }
    }

    pub fn lookup(&self, key: &K) -> Lookup<V> {
        self.inner.lookup(key)
    }

    pub fn set(&self, key: K, value: V) {
        self.inner.store(key, value);
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.entries.remove(key);
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Return the fresh value for `key`, or run `loader` to produce it.
    ///
    /// At most one loader runs per key at a time; concurrent callers await
    /// the same result. The load runs as its own task, so a caller giving up
    /// does not cancel it and the result still lands in the cache.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        if let Some(value) = self.get(&key) {
            metrics::counter!(CACHE_HITS_TOTAL, "cache" => self.inner.name).increment(1);
            return value;
        }
        self.join_or_start(key, loader).await
    }

    /// Stale-while-revalidate read for presentation-facing callers.
    ///
    /// A stale entry is returned immediately and refreshed in the background.
    pub async fn get_or_refresh<F, Fut>(&self, key: K, loader: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        match self.inner.lookup(&key) {
            Lookup::Fresh(value) => {
                metrics::counter!(CACHE_HITS_TOTAL, "cache" => self.inner.name).increment(1);
                value
            }
            Lookup::Stale(value) => {
                metrics::counter!(CACHE_STALE_SERVED_TOTAL, "cache" => self.inner.name)
                    .increment(1);
                drop(self.join_or_start(key, loader));
                value
            }
            Lookup::Miss => self.join_or_start(key, loader).await,
        }
    }

    fn join_or_start<F, Fut>(&self, key: K, loader: F) -> InFlight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (task, started) = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(pending) => {
                metrics::counter!(CACHE_INFLIGHT_JOINS_TOTAL, "cache" => self.inner.name)
                    .increment(1);
                (pending.get().clone(), false)
            }
            Entry::Vacant(slot) => {
                metrics::counter!(CACHE_MISSES_TOTAL, "cache" => self.inner.name).increment(1);
                let inner = Arc::clone(&self.inner);
                let load = loader();
                let task = async move {
                    // A panicking loader must still release its key, or every
                    // later caller would join the poisoned future.
                    let value = match AssertUnwindSafe(load).catch_unwind().await {
                        Ok(value) => value,
                        Err(panic) => {
                            inner.in_flight.remove(&key);
                            std::panic::resume_unwind(panic);
                        }
                    };
                    if (inner.admit)(&value) {
                        inner.store(key.clone(), value.clone());
                    }
                    inner.in_flight.remove(&key);
                    value
                }
                .boxed()
                .shared();
                slot.insert(task.clone());
                (task, true)
            }
        };
        // Spawned only after the map guard is released: the task removes
        // itself from `in_flight` when done.
        if started {
            tokio::spawn(task.clone());
        }
        task
    }
}
