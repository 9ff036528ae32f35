//! Concurrent TTL cache with a background sweeper
//!
//! A string-keyed map where every entry carries its own expiry deadline.
//! Readers treat expired entries as absent but leave physical removal to
//! the sweeper task, which runs on a fixed interval and invokes the
//! eviction callback for every entry it collects.
//!
//! Two removal paths exist with deliberately different callback
//! behavior, and consumers rely on the difference:
//!
//! - [`TtlCache::remove`] removes synchronously and fires the eviction
//!   callback exactly once;
//! - [`TtlCache::pop`] removes synchronously but SKIPS the callback, so
//!   the caller receives a live value the callback cannot tear down.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use kexuedns::util::ttlcache::{Ttl, TtlCache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(10), None, None);
//! cache.set("key", 1, Ttl::Default);
//! assert_eq!(cache.get("key"), Some(1));
//! assert_eq!(cache.pop("key"), Some(1));
//! assert_eq!(cache.get("key"), None);
//! cache.close().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sweep interval used when neither an interval nor a default TTL is given.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Entry lifetime for an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Use the cache's default TTL.
    Default,
    /// Never expire.
    Forever,
    /// Expire after the given duration.
    After(Duration),
}

/// Error returned by [`TtlCache::add`] when a live entry already exists.
#[derive(Debug, Error)]
#[error("key already exists")]
pub struct KeyExists;

/// Callback invoked with the key and value of an evicted entry.
pub type EvictFn<V> = Box<dyn Fn(&str, V) + Send + Sync>;

struct Entry<V> {
    value: V,
    /// `None` means the entry never expires.
    expire_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expire_at {
            Some(at) => at <= now,
            None => false,
        }
    }
}

struct Shared<V> {
    items: DashMap<String, Entry<V>>,
    default_ttl: Duration,
    on_evict: Option<EvictFn<V>>,
}

impl<V> Shared<V> {
    fn expire_at(&self, ttl: Ttl) -> Option<Instant> {
        match ttl {
            Ttl::Forever => None,
            Ttl::Default => Some(Instant::now() + self.default_ttl),
            Ttl::After(d) => Some(Instant::now() + d),
        }
    }

    fn evict(&self, key: &str, value: V) {
        if let Some(f) = &self.on_evict {
            f(key, value);
        }
    }
}

/// Concurrent map with per-entry expiry and a background sweeper.
///
/// Backed by a sharded hash map, so the accept and receive paths of a
/// session table can hit it concurrently without a global lock.
pub struct TtlCache<V> {
    shared: Arc<Shared<V>>,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache and start its sweeper task.
    ///
    /// `interval` defaults to half the default TTL, falling back to 5 s
    /// when that is zero. Must be called within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `default_ttl` - lifetime applied by [`Ttl::Default`]
    /// * `interval` - sweep period override
    /// * `on_evict` - callback for swept and [`TtlCache::remove`]d entries
    #[must_use]
    pub fn new(default_ttl: Duration, interval: Option<Duration>, on_evict: Option<EvictFn<V>>) -> Self {
        let interval = interval.unwrap_or_else(|| {
            let half = default_ttl / 2;
            if half.is_zero() {
                DEFAULT_SWEEP_INTERVAL
            } else {
                half
            }
        });

        let shared = Arc::new(Shared {
            items: DashMap::new(),
            default_ttl,
            on_evict,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(Self::sweep_loop(Arc::clone(&shared), interval, shutdown_rx));

        Self {
            shared,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Insert `value` under `key` unless a live entry is already present.
    ///
    /// An expired entry does not count as present and is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`KeyExists`] when a live entry occupies the key.
    pub fn add(&self, key: &str, value: V, ttl: Ttl) -> Result<(), KeyExists> {
        let expire_at = self.shared.expire_at(ttl);
        match self.shared.items.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(Instant::now()) {
                    return Err(KeyExists);
                }
                occupied.insert(Entry { value, expire_at });
                Ok(())
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry { value, expire_at });
                Ok(())
            }
        }
    }

    /// Insert `value` under `key`, overwriting unconditionally.
    pub fn set(&self, key: &str, value: V, ttl: Ttl) {
        let expire_at = self.shared.expire_at(ttl);
        self.shared
            .items
            .insert(key.to_string(), Entry { value, expire_at });
    }

    /// Get the value for `key` if the entry exists and is still live.
    ///
    /// Expired entries are reported as absent; the hot path never sweeps.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.shared.items.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Remove the entry synchronously and return its value if still live.
    ///
    /// The eviction callback is NOT invoked, so the returned value stays
    /// usable by the caller.
    pub fn pop(&self, key: &str) -> Option<V> {
        let (_, entry) = self.shared.items.remove(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value)
    }

    /// Remove the entry synchronously and invoke the eviction callback
    /// exactly once if the entry was present.
    pub fn remove(&self, key: &str) {
        if let Some((key, entry)) = self.shared.items.remove(key) {
            self.shared.evict(&key, entry.value);
        }
    }

    /// Number of entries physically present, including not-yet-swept ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.items.len()
    }

    /// Whether the map is physically empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.items.is_empty()
    }

    /// Stop the sweeper task and wait for it to finish. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn sweep_loop(
        shared: Arc<Shared<V>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval() fires immediately; skip that first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let now = Instant::now();
            let expired: Vec<String> = shared
                .items
                .iter()
                .filter(|item| item.value().is_expired(now))
                .map(|item| item.key().clone())
                .collect();

            // Callbacks run outside the shard locks.
            for key in expired {
                if let Some((key, entry)) =
                    shared.items.remove_if(&key, |_, entry| entry.is_expired(now))
                {
                    shared.evict(&key, entry.value);
                }
            }
        }
    }
}

impl<V> Drop for TtlCache<V> {
    fn drop(&mut self) {
        // Stop the sweeper even when close() was never awaited.
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
