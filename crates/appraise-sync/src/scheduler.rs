//! Revalidation scheduling: decides when a cached key is refetched.
//!
//! Four triggers can demand a fetch — explicit request, interval elapsed,
//! focus regained, transport reconnect. Triggers coinciding within the
//! deduping window collapse to a single fetch, and concurrent demands for
//! one key join a single in-flight request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::error::FetchError;
use crate::key::{KeyFamily, RecordKey};
use crate::store::{CacheValue, EntityStore};

/// Minimum sleep duration between scheduler ticks.
const MIN_SLEEP_SECS: u64 = 1;

/// Maximum sleep duration between scheduler ticks.
const MAX_SLEEP_SECS: u64 = 30;

/// How long an unwatched entry is retained before eviction.
const IDLE_RETENTION: Duration = Duration::from_secs(300);

/// Why a revalidation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidateTrigger {
    /// Caller-requested refetch.
    Explicit,
    /// The key family's refresh interval elapsed.
    IntervalElapsed,
    /// The window or tab regained focus.
    FocusRegained,
    /// The push transport reconnected.
    Reconnected,
}

/// Per key-family revalidation configuration.
#[derive(Debug, Clone)]
pub struct RevalidationPolicy {
    /// Poll period. `None` disables interval polling for the family.
    pub refresh_interval: Option<Duration>,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    /// Window within which coinciding triggers collapse to one fetch.
    pub deduping_interval: Duration,
    /// Retries after the initial failed attempt.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_backoff * n`.
    pub retry_backoff: Duration,
}

impl RevalidationPolicy {
    /// Policy for families kept live by interval polling.
    pub fn polled() -> Self {
        Self {
            refresh_interval: Some(Duration::from_secs(30)),
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            deduping_interval: Duration::from_secs(2),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Policy for families refreshed only on demand. Search results are
    /// intentionally not kept live: their parameters are user-driven and
    /// volatile.
    pub fn on_demand() -> Self {
        Self {
            refresh_interval: None,
            ..Self::polled()
        }
    }

    /// Linear backoff delay before retry `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt
    }
}

/// Revalidation policies per key family.
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub list: RevalidationPolicy,
    pub record: RevalidationPolicy,
    pub search: RevalidationPolicy,
    pub stats: RevalidationPolicy,
    pub history: RevalidationPolicy,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            list: RevalidationPolicy::polled(),
            record: RevalidationPolicy::polled(),
            search: RevalidationPolicy::on_demand(),
            stats: RevalidationPolicy::polled(),
            history: RevalidationPolicy::polled(),
        }
    }
}

impl PolicySet {
    /// The policy governing a key.
    pub fn for_key(&self, key: &RecordKey) -> &RevalidationPolicy {
        match key.family() {
            KeyFamily::List => &self.list,
            KeyFamily::Record => &self.record,
            KeyFamily::Search => &self.search,
            KeyFamily::Stats => &self.stats,
            KeyFamily::History => &self.history,
        }
    }
}

/// Fetches the value for a cache key from the backend.
///
/// The production implementation maps each key family onto its HTTP
/// endpoint; tests substitute counting or failing fetchers.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, key: &RecordKey) -> Result<CacheValue, FetchError>;
}

enum FlightRole {
    /// This call performs the fetch and announces completion.
    Leader(watch::Sender<bool>),
    /// Another call is already fetching; wait for it to settle.
    Waiter(watch::Receiver<bool>),
    /// Nothing to do: the entry is fresh within the dedup window.
    Skip,
}

/// Decides when cached keys are refetched and performs the fetches.
pub struct RevalidationScheduler {
    store: Arc<EntityStore>,
    fetcher: Arc<dyn RecordFetcher>,
    policies: PolicySet,
    /// Single-flight table: at most one in-flight fetch per key.
    inflight: Mutex<HashMap<RecordKey, watch::Receiver<bool>>>,
}

impl RevalidationScheduler {
    /// Create a new scheduler over the given store and fetcher.
    pub fn new(
        store: Arc<EntityStore>,
        fetcher: Arc<dyn RecordFetcher>,
        policies: PolicySet,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fetcher,
            policies,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// The store this scheduler revalidates.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Revalidate one key.
    ///
    /// Joins an in-flight fetch if one exists; otherwise fetches unless the
    /// entry is fresh within the deduping window. A waiter that finds the
    /// entry stale again after the flight settles (a mutation landed while
    /// the fetch was running) starts over, so the stale value cannot stick.
    pub async fn revalidate(
        &self,
        key: &RecordKey,
        trigger: RevalidateTrigger,
    ) -> Result<(), Arc<FetchError>> {
        loop {
            let role = {
                let mut inflight = self.inflight.lock().expect("inflight table poisoned");
                if let Some(rx) = inflight.get(key) {
                    FlightRole::Waiter(rx.clone())
                } else if !self.needs_fetch(key, trigger) {
                    FlightRole::Skip
                } else {
                    let (tx, rx) = watch::channel(false);
                    inflight.insert(key.clone(), rx);
                    FlightRole::Leader(tx)
                }
            };

            match role {
                FlightRole::Skip => {
                    trace!(key = %key, ?trigger, "revalidation deduplicated");
                    return self.settled_result(key);
                }
                FlightRole::Waiter(mut rx) => {
                    let _ = rx.wait_for(|done| *done).await;
                    if self.store.is_stale(key) {
                        continue;
                    }
                    return self.settled_result(key);
                }
                FlightRole::Leader(tx) => {
                    let result = self.fetch_with_retries(key).await;
                    self.inflight
                        .lock()
                        .expect("inflight table poisoned")
                        .remove(key);
                    let _ = tx.send(true);
                    return result;
                }
            }
        }
    }

    /// Whether a fetch is warranted for this key and trigger.
    fn needs_fetch(&self, key: &RecordKey, trigger: RevalidateTrigger) -> bool {
        let policy = self.policies.for_key(key);
        let Some(snap) = self.store.snapshot(key) else {
            return true;
        };
        if snap.stale {
            return true;
        }
        if snap.value.is_none() && snap.error.is_none() {
            return true;
        }
        // A settled attempt inside the dedup window absorbs every trigger.
        if let Some(at) = snap.last_attempt
            && at.elapsed() < policy.deduping_interval
        {
            return false;
        }
        match trigger {
            RevalidateTrigger::Explicit
            | RevalidateTrigger::FocusRegained
            | RevalidateTrigger::Reconnected => true,
            RevalidateTrigger::IntervalElapsed => match policy.refresh_interval {
                None => false,
                Some(interval) => snap
                    .last_attempt
                    .map(|at| at.elapsed() >= interval)
                    .unwrap_or(true),
            },
        }
    }

    /// The outcome currently recorded on the entry.
    fn settled_result(&self, key: &RecordKey) -> Result<(), Arc<FetchError>> {
        match self.store.snapshot(key).and_then(|snap| snap.error) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Run one fetch with linear-backoff retries. The entry's `is_validating`
    /// flag covers the whole sequence; last-known-good data survives failure.
    async fn fetch_with_retries(&self, key: &RecordKey) -> Result<(), Arc<FetchError>> {
        let policy = self.policies.for_key(key).clone();
        self.store.begin_validation(key);

        let mut attempt = 1u32;
        loop {
            match self.fetcher.fetch(key).await {
                Ok(value) => {
                    debug!(key = %key, attempt, "fetch settled");
                    self.store.complete_fetch(key, Ok(value));
                    return Ok(());
                }
                Err(fetch_error) => {
                    if attempt <= policy.max_retries {
                        let delay = policy.retry_delay(attempt);
                        warn!(
                            key = %key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %fetch_error,
                            "fetch failed, retrying"
                        );
                        sleep(delay).await;
                        attempt += 1;
                    } else {
                        let fetch_error = Arc::new(fetch_error);
                        error!(
                            key = %key,
                            attempts = attempt,
                            error = %fetch_error,
                            "fetch retries exhausted"
                        );
                        self.store
                            .complete_fetch(key, Err(Arc::clone(&fetch_error)));
                        return Err(fetch_error);
                    }
                }
            }
        }
    }

    /// Revalidate every subscribed key whose policy reacts to focus.
    pub fn notify_focus(self: &Arc<Self>) {
        self.trigger_subscribed(RevalidateTrigger::FocusRegained, |p| p.revalidate_on_focus);
    }

    /// Revalidate every subscribed key whose policy reacts to reconnect.
    pub fn notify_reconnect(self: &Arc<Self>) {
        self.trigger_subscribed(RevalidateTrigger::Reconnected, |p| {
            p.revalidate_on_reconnect
        });
    }

    fn trigger_subscribed(
        self: &Arc<Self>,
        trigger: RevalidateTrigger,
        selected: impl Fn(&RevalidationPolicy) -> bool,
    ) {
        for key in self.store.subscribed_keys() {
            if selected(self.policies.for_key(&key)) {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    // failures are parked on the entry
                    let _ = scheduler.revalidate(&key, trigger).await;
                });
            }
        }
    }

    /// Interval loop: refetches due subscribed keys and evicts idle entries
    /// until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("revalidation scheduler starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            for key in self.store.subscribed_keys() {
                if self.needs_fetch(&key, RevalidateTrigger::IntervalElapsed) {
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _ = scheduler
                            .revalidate(&key, RevalidateTrigger::IntervalElapsed)
                            .await;
                    });
                }
            }

            self.store.evict_idle(IDLE_RETENTION);

            let sleep_duration = self.calculate_sleep_duration();
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        info!("revalidation scheduler shut down");
    }

    /// Sleep until the next subscribed key comes due, clamped to
    /// [`MIN_SLEEP_SECS`, `MAX_SLEEP_SECS`].
    fn calculate_sleep_duration(&self) -> Duration {
        let mut next_due: Option<Duration> = None;

        for key in self.store.subscribed_keys() {
            let policy = self.policies.for_key(&key);
            let Some(interval) = policy.refresh_interval else {
                continue;
            };
            let due_in = match self.store.snapshot(&key).and_then(|s| s.last_attempt) {
                None => Duration::ZERO,
                Some(at) => interval.saturating_sub(at.elapsed()),
            };
            next_due = Some(next_due.map_or(due_in, |d| d.min(due_in)));
        }

        let secs = next_due
            .map(|d| d.as_secs().clamp(MIN_SLEEP_SECS, MAX_SLEEP_SECS))
            .unwrap_or(MAX_SLEEP_SECS);
        Duration::from_secs(secs)
    }
}
