//! Keyed Blocking Cache
//!
//! A map from [`CacheKey`] to immutable [`CacheEntry`] values where concurrent
//! misses on the same key are collapsed into a single population.
//!
//! # Design
//!
//! ```text
//!            ┌──────────── slots: DashMap<CacheKey, Slot> ────────────┐
//!  get ───▶  │ Ready(Arc<CacheEntry>)   → returned without waiting    │
//!            │ Pending(watch::Receiver) → wait (bounded) for builder  │
//!            │ (vacant)                 → caller becomes the builder  │
//!            └────────────────────────────────────────────────────────┘
//! ```
//!
//! - Exactly one producer runs per key per population cycle
//! - Waiters are released together when the builder finishes
//! - A failed, panicking or cancelled builder always releases its waiters
//! - Entries are published whole; readers never observe a partial entry

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::entry::{CacheEntry, CacheKey};
use super::metrics::CacheMetrics;
use crate::error::{Error, Result};

/// Default bound on how long a waiter blocks for another caller's population
pub const DEFAULT_POPULATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What a producer hands back for a key
#[derive(Debug)]
pub enum Population {
    /// Publish the entry for later lookups
    Store(CacheEntry),
    /// Hand the entry to this cycle's callers only, then forget it
    ServeOnce(CacheEntry),
}

/// Where a lookup's entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    /// Already cached
    Hit,
    /// This caller ran the producer
    Built,
    /// Another caller ran the producer while this one waited
    Joined,
}

/// Result of [`KeyedBlockingCache::get_or_compute`]
#[derive(Debug, Clone)]
pub struct Lookup {
    /// The entry to serve
    pub entry: Arc<CacheEntry>,
    /// How it was obtained
    pub source: LookupSource,
    /// False when the producer asked for the entry not to be kept
    pub stored: bool,
}

type Outcome = std::result::Result<(Arc<CacheEntry>, bool), String>;

enum Slot {
    Ready(Arc<CacheEntry>),
    Pending {
        id: u64,
        rx: watch::Receiver<Option<Outcome>>,
    },
}

enum Role {
    Waiter(watch::Receiver<Option<Outcome>>),
    Builder(u64, watch::Sender<Option<Outcome>>),
}

/// Single-flight cache of HTTP responses
pub struct KeyedBlockingCache {
    /// Cache name, for logs
    name: String,
    slots: DashMap<CacheKey, Slot>,
    timeout: Duration,
    next_id: AtomicU64,
    metrics: Arc<CacheMetrics>,
}

impl KeyedBlockingCache {
    /// Create a cache with the default population timeout
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeout(name, DEFAULT_POPULATION_TIMEOUT)
    }

    /// Create a cache whose waiters give up after `timeout`
    pub fn with_timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            slots: DashMap::new(),
            timeout,
            next_id: AtomicU64::new(1),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// Share an existing metrics collector
    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Return the cached entry for `key`, or populate it with `producer`.
    ///
    /// The first caller to miss runs `producer`; concurrent callers for the
    /// same key wait up to the population timeout and then fail with
    /// [`Error::LockTimeout`]. A producer error reaches every caller of the
    /// cycle as [`Error::OriginFailure`] and leaves the key unlocked.
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, producer: F) -> Result<Lookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Population>>,
    {
        let role = match self.slots.entry(key.clone()) {
            Entry::Occupied(slot) => match slot.get() {
                Slot::Ready(entry) => {
                    self.metrics.record_hit();
                    return Ok(Lookup {
                        entry: entry.clone(),
                        source: LookupSource::Hit,
                        stored: true,
                    });
                }
                Slot::Pending { rx, .. } => Role::Waiter(rx.clone()),
            },
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(Slot::Pending { id, rx });
                Role::Builder(id, tx)
            }
        };

        match role {
            Role::Waiter(rx) => self.wait(key, rx).await,
            Role::Builder(id, tx) => {
                self.metrics.record_miss();
                self.build(key, id, tx, producer).await
            }
        }
    }

    async fn wait(
        &self,
        key: &CacheKey,
        mut rx: watch::Receiver<Option<Outcome>>,
    ) -> Result<Lookup> {
        self.metrics.record_joined_wait();
        debug!(cache = %self.name, key = %key, "Waiting for in-flight population");

        let outcome = match tokio::time::timeout(self.timeout, rx.wait_for(Option::is_some)).await
        {
            Ok(Ok(outcome)) => outcome.clone(),
            Ok(Err(_)) => Some(Err("population channel closed".to_string())),
            Err(_) => {
                self.metrics.record_lock_timeout();
                warn!(
                    cache = %self.name,
                    key = %key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for cache population"
                );
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        match outcome {
            Some(Ok((entry, stored))) => Ok(Lookup {
                entry,
                source: LookupSource::Joined,
                stored,
            }),
            Some(Err(reason)) => Err(Error::origin(key.as_str(), reason)),
            None => Err(Error::Internal(format!(
                "population of {} finished without an outcome",
                key
            ))),
        }
    }

    async fn build<F, Fut>(
        &self,
        key: &CacheKey,
        id: u64,
        tx: watch::Sender<Option<Outcome>>,
        producer: F,
    ) -> Result<Lookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Population>>,
    {
        let guard = BuildGuard {
            cache: self,
            key: key.clone(),
            id,
            tx: Some(tx),
        };

        self.metrics.record_build();
        debug!(cache = %self.name, key = %key, "Populating cache entry");

        match producer().await {
            Ok(Population::Store(entry)) => {
                let entry = Arc::new(entry);
                guard.finish(Ok((entry.clone(), true)), Some(entry.clone()));
                Ok(Lookup {
                    entry,
                    source: LookupSource::Built,
                    stored: true,
                })
            }
            Ok(Population::ServeOnce(entry)) => {
                self.metrics.record_uncacheable();
                let entry = Arc::new(entry);
                guard.finish(Ok((entry.clone(), false)), None);
                Ok(Lookup {
                    entry,
                    source: LookupSource::Built,
                    stored: false,
                })
            }
            Err(e) => {
                self.metrics.record_origin_failure();
                let reason = e.to_string();
                error!(cache = %self.name, key = %key, error = %reason, "Cache population failed");
                guard.finish(Err(reason.clone()), None);
                Err(Error::origin(key.as_str(), reason))
            }
        }
    }

    /// Return the published entry for `key` without waiting or populating
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        match self.slots.get(key)?.value() {
            Slot::Ready(entry) => Some(entry.clone()),
            Slot::Pending { .. } => None,
        }
    }

    /// Flag `entry` stale so the next lookup rebuilds it.
    ///
    /// Only removes the slot if it still holds this exact entry, so a fresher
    /// entry published concurrently survives. Returns true if removed.
    pub fn mark_stale(&self, key: &CacheKey, entry: &Arc<CacheEntry>) -> bool {
        let removed = self
            .slots
            .remove_if(key, |_, slot| {
                matches!(slot, Slot::Ready(current) if Arc::ptr_eq(current, entry))
            })
            .is_some();
        if removed {
            self.metrics.record_stale();
            debug!(cache = %self.name, key = %key, "Entry flagged stale");
        }
        removed
    }

    /// Publish an entry directly, replacing any ready entry.
    ///
    /// A population in flight for the key is left alone and this call
    /// returns false.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) -> bool {
        match self.slots.entry(key) {
            Entry::Occupied(mut slot) => {
                if matches!(slot.get(), Slot::Pending { .. }) {
                    return false;
                }
                slot.insert(Slot::Ready(Arc::new(entry)));
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Ready(Arc::new(entry)));
                true
            }
        }
    }

    /// Drop the entry for `key`. Returns true if a ready entry was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Ready(_)))
            .is_some()
    }

    /// Drop every ready entry. Populations in flight finish normally.
    pub fn clear(&self) {
        self.slots.retain(|_, slot| matches!(slot, Slot::Pending { .. }));
    }

    /// Number of ready entries
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
            .count()
    }

    /// True when no entry is ready
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently being populated
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Pending { .. }))
            .count()
    }

    /// Keys of ready entries, sorted
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Total bytes held by ready entries
    pub fn size(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| match slot.value() {
                Slot::Ready(entry) => entry.size(),
                Slot::Pending { .. } => 0,
            })
            .sum()
    }

    /// Cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Population timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for KeyedBlockingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedBlockingCache")
            .field("name", &self.name)
            .field("entries", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Releases a key's waiters on every exit path of a population.
///
/// Dropped without [`finish`](Self::finish) (producer panicked or the
/// builder's future was cancelled) it removes the pending slot and fails
/// the waiters.
struct BuildGuard<'a> {
    cache: &'a KeyedBlockingCache,
    key: CacheKey,
    id: u64,
    tx: Option<watch::Sender<Option<Outcome>>>,
}

impl BuildGuard<'_> {
    fn finish(mut self, outcome: Outcome, publish: Option<Arc<CacheEntry>>) {
        match publish {
            Some(entry) => {
                if let Some(mut slot) = self.cache.slots.get_mut(&self.key) {
                    if self.owns(slot.value()) {
                        *slot = Slot::Ready(entry);
                    }
                }
            }
            None => self.release_slot(),
        }
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }

    fn owns(&self, slot: &Slot) -> bool {
        matches!(slot, Slot::Pending { id, .. } if *id == self.id)
    }

    fn release_slot(&self) {
        let id = self.id;
        self.cache
            .slots
            .remove_if(&self.key, |_, slot| matches!(slot, Slot::Pending { id: owner, .. } if *owner == id));
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!(
                cache = %self.cache.name,
                key = %self.key,
                "Population abandoned, releasing waiters"
            );
            self.release_slot();
            tx.send_replace(Some(Err("population abandoned before completion".to_string())));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
