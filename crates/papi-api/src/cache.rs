//! TTL cache with single-flight fetch coalescing
//!
//! Catalog reads are slow (one upstream HTTP round trip per item), so
//! results are cached with explicit TTLs. Concurrent misses for the same
//! key coalesce into a single upstream fetch; the losers wait and read the
//! winner's result. Time is injectable so expiry is deterministic in tests.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use papi_common::Result;

/// Time source for expiry decisions
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic expiry tests
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at construction time
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        })
    }

    /// Advance the clock
    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// A keyed cache with one TTL for all entries
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<K, Entry<V>>>,
    flights: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Create a cache with the given TTL
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Create a cache with an injected clock
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh cached value, if any
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if self.clock.now().duration_since(entry.inserted) >= self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert a value
    pub async fn insert(&self, key: K, value: V) {
        self.entries.write().await.insert(
            key,
            Entry {
                value,
                inserted: self.clock.now(),
            },
        );
    }

    /// Return the cached value, or run `fetch` once to populate it.
    ///
    /// Concurrent callers with the same key share a single fetch. Errors
    /// are not cached: the next caller fetches again.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // The winner may have populated the entry while we waited
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let result = fetch().await;
        if let Ok(value) = &result {
            self.insert(key.clone(), value.clone()).await;
        }

        let mut flights = self.flights.lock().await;
        flights.remove(&key);

        result
    }

    /// Drop one entry
    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drop entries matching a predicate
    pub async fn invalidate_matching(&self, predicate: impl Fn(&K) -> bool) {
        self.entries.write().await.retain(|k, _| !predicate(k));
    }

    /// Drop everything
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
