//! In-memory entity store: the single source of truth for cached records.
//!
//! All components read and write through this store; none of them holds a
//! private copy of record data. Every mutation is synchronous and atomic per
//! entry, and subscribers observe changes through a broadcast channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use appraise_api::{ApprovalEvent, EvaluationRecord, RecordStats};

use crate::error::FetchError;
use crate::key::{KeyFilter, RecordKey};

/// Broadcast channel capacity for store events.
/// Sized for push-channel reconnection bursts; a lagged subscriber simply
/// re-reads snapshots.
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Typed cache payload, one variant per key family.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Record(EvaluationRecord),
    List(Vec<EvaluationRecord>),
    Stats(RecordStats),
    History(Vec<ApprovalEvent>),
}

impl CacheValue {
    pub fn as_record(&self) -> Option<&EvaluationRecord> {
        match self {
            CacheValue::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[EvaluationRecord]> {
        match self {
            CacheValue::List(records) => Some(records),
            _ => None,
        }
    }

    pub fn as_stats(&self) -> Option<&RecordStats> {
        match self {
            CacheValue::Stats(stats) => Some(stats),
            _ => None,
        }
    }

    pub fn as_history(&self) -> Option<&[ApprovalEvent]> {
        match self {
            CacheValue::History(events) => Some(events),
            _ => None,
        }
    }
}

/// Change notification for store subscribers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The entry's value changed (fetch settled or silent splice).
    Updated { key: RecordKey },
    /// The entry was marked stale and should be refetched.
    Invalidated { key: RecordKey },
    /// A fetch for the entry failed terminally; `error` is set, data retained.
    Failed { key: RecordKey },
    /// The entry was dropped from the cache.
    Evicted { key: RecordKey },
}

/// One cache entry. Internal; read through [`EntrySnapshot`].
struct CacheEntry {
    value: Option<CacheValue>,
    error: Option<Arc<FetchError>>,
    /// When the last *successful* fetch settled.
    fetched_at: Option<Instant>,
    /// When the last fetch settled, success or failure. Freshness and dedup
    /// decisions key off this so a failing key is not refetched in a hot loop.
    last_attempt: Option<Instant>,
    is_validating: bool,
    stale: bool,
    subscribers: usize,
    last_touched: Instant,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            value: None,
            error: None,
            fetched_at: None,
            last_attempt: None,
            is_validating: false,
            stale: false,
            subscribers: 0,
            last_touched: Instant::now(),
        }
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            value: self.value.clone(),
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            last_attempt: self.last_attempt,
            is_validating: self.is_validating,
            stale: self.stale,
            subscribers: self.subscribers,
        }
    }
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub value: Option<CacheValue>,
    pub error: Option<Arc<FetchError>>,
    pub fetched_at: Option<Instant>,
    pub last_attempt: Option<Instant>,
    pub is_validating: bool,
    pub stale: bool,
    pub subscribers: usize,
}

impl EntrySnapshot {
    /// An entry that has never been touched.
    pub fn empty() -> Self {
        Self {
            value: None,
            error: None,
            fetched_at: None,
            last_attempt: None,
            is_validating: false,
            stale: false,
            subscribers: 0,
        }
    }

    /// First load: a fetch is running and there is nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.value.is_none() && self.is_validating
    }
}

/// Keyed in-memory cache with per-entry freshness metadata.
///
/// Explicitly constructed; tests instantiate isolated stores instead of
/// sharing process-wide state.
pub struct EntityStore {
    entries: DashMap<RecordKey, CacheEntry>,
    updates_tx: broadcast::Sender<StoreEvent>,
}

impl EntityStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            updates_tx,
        })
    }

    /// Subscribe to store change events.
    pub fn updates(&self) -> broadcast::Receiver<StoreEvent> {
        self.updates_tx.subscribe()
    }

    fn broadcast(&self, event: StoreEvent) {
        if self.updates_tx.send(event).is_err() {
            trace!("no subscribers for store event");
        }
    }

    /// Point-in-time view of an entry, if one exists.
    pub fn snapshot(&self, key: &RecordKey) -> Option<EntrySnapshot> {
        self.entries.get(key).map(|entry| entry.snapshot())
    }

    /// Register a subscriber for a key. The returned guard releases the
    /// subscription when dropped, on every exit path.
    pub fn subscribe(self: &Arc<Self>, key: &RecordKey) -> SubscriptionGuard {
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(CacheEntry::new);
            entry.subscribers += 1;
            entry.last_touched = Instant::now();
        }
        trace!(key = %key, "store: subscriber added");
        SubscriptionGuard {
            store: Arc::clone(self),
            key: key.clone(),
        }
    }

    fn release(&self, key: &RecordKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            entry.last_touched = Instant::now();
            trace!(key = %key, remaining = entry.subscribers, "store: subscriber removed");
        }
    }

    /// Replace an entry's value through an updater.
    ///
    /// With `revalidate = false` this is a **silent splice**: the value
    /// changes, the entry is not flagged stale, and no fetch is triggered —
    /// used for optimistic writes and push-driven merges. With
    /// `revalidate = true` the entry is additionally marked stale so the next
    /// read reconciles against the server.
    pub fn set_data<F>(&self, key: &RecordKey, update: F, revalidate: bool)
    where
        F: FnOnce(Option<CacheValue>) -> Option<CacheValue>,
    {
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(CacheEntry::new);
            let current = entry.value.take();
            entry.value = update(current);
            entry.last_touched = Instant::now();
            if revalidate {
                entry.stale = true;
            }
        }
        trace!(key = %key, revalidate, "store: value written");
        if revalidate {
            self.broadcast(StoreEvent::Invalidated { key: key.clone() });
        } else {
            self.broadcast(StoreEvent::Updated { key: key.clone() });
        }
    }

    /// Mark every entry matching the filter stale.
    pub fn invalidate(&self, filter: &KeyFilter) {
        let mut hit = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.key().matches(filter) {
                entry.stale = true;
                entry.last_touched = Instant::now();
                hit.push(entry.key().clone());
            }
        }
        debug!(?filter, count = hit.len(), "store: invalidated");
        for key in hit {
            self.broadcast(StoreEvent::Invalidated { key });
        }
    }

    /// Drop the cached value for a key (used when a record is deleted
    /// server-side). The entry itself is removed once nobody watches it.
    pub fn clear(&self, key: &RecordKey) {
        let remove = {
            match self.entries.get_mut(key) {
                None => return,
                Some(mut entry) => {
                    if entry.subscribers == 0 && !entry.is_validating {
                        true
                    } else {
                        entry.value = None;
                        entry.error = None;
                        entry.fetched_at = None;
                        entry.stale = false;
                        entry.last_touched = Instant::now();
                        false
                    }
                }
            }
        };
        if remove {
            self.entries.remove(key);
            self.broadcast(StoreEvent::Evicted { key: key.clone() });
        } else {
            self.broadcast(StoreEvent::Updated { key: key.clone() });
        }
        trace!(key = %key, removed = remove, "store: cleared");
    }

    /// Flag that a fetch is in flight for this key.
    pub fn begin_validation(&self, key: &RecordKey) {
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new);
        entry.is_validating = true;
        entry.last_touched = Instant::now();
    }

    /// Settle the in-flight fetch for this key.
    ///
    /// Success replaces the value and clears `stale` and `error`. Failure
    /// records the error and *keeps* the last-known-good value; the stale
    /// flag is consumed either way, so the failing key retries on its next
    /// trigger instead of spinning.
    pub fn complete_fetch(&self, key: &RecordKey, result: Result<CacheValue, Arc<FetchError>>) {
        let event = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(CacheEntry::new);
            let now = Instant::now();
            entry.is_validating = false;
            entry.last_attempt = Some(now);
            entry.last_touched = now;
            entry.stale = false;
            match result {
                Ok(value) => {
                    entry.value = Some(value);
                    entry.error = None;
                    entry.fetched_at = Some(now);
                    StoreEvent::Updated { key: key.clone() }
                }
                Err(error) => {
                    entry.error = Some(error);
                    StoreEvent::Failed { key: key.clone() }
                }
            }
        };
        trace!(key = %key, "store: fetch settled");
        self.broadcast(event);
    }

    /// Whether the entry is currently flagged stale.
    pub fn is_stale(&self, key: &RecordKey) -> bool {
        self.entries.get(key).map(|e| e.stale).unwrap_or(false)
    }

    /// Keys that currently have at least one subscriber.
    pub fn subscribed_keys(&self) -> Vec<RecordKey> {
        self.entries
            .iter()
            .filter(|entry| entry.subscribers > 0)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every key with an entry, subscribed or not.
    pub fn keys(&self) -> Vec<RecordKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop entries nobody watches that have been idle past the retention
    /// window. In-flight entries are kept; the fetch is allowed to complete
    /// and populate the cache for a future subscriber.
    pub fn evict_idle(&self, retention: Duration) {
        let mut evicted = Vec::new();
        self.entries.retain(|key, entry| {
            let keep = entry.subscribers > 0
                || entry.is_validating
                || entry.last_touched.elapsed() < retention;
            if !keep {
                evicted.push(key.clone());
            }
            keep
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "store: evicted idle entries");
        }
        for key in evicted {
            self.broadcast(StoreEvent::Evicted { key });
        }
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Holds one subscription to one key; dropping it releases the subscription.
pub struct SubscriptionGuard {
    store: Arc<EntityStore>,
    key: RecordKey,
}

impl SubscriptionGuard {
    /// The key this guard subscribes to.
    pub fn key(&self) -> &RecordKey {
        &self.key
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}
