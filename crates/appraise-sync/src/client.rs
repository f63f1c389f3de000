//! Consumer facade: wires the store, scheduler, mutation engine and push
//! channel together behind one handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use appraise_api::{
    ApiConfig, ApiError, EvaluationRecord, RecordApi, RecordPatch, SignaturePayload,
};

use crate::channel::{ChannelStatus, PushChannel, PushTransport, WebSocketTransport};
use crate::dispatch::{PushUpdate, apply_push_update};
use crate::error::{FetchError, MutationError};
use crate::key::{KeyFilter, RecordKey};
use crate::mutation::{MutationEngine, RecordMutator};
use crate::scheduler::{
    PolicySet, RecordFetcher, RevalidateTrigger, RevalidationScheduler,
};
use crate::store::{CacheValue, EntityStore, EntrySnapshot, StoreEvent, SubscriptionGuard};

/// Configuration for a [`SyncClient`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub policies: PolicySet,
    /// Base delay for push channel reconnect backoff.
    pub channel_base_delay: Duration,
    /// Cap on consecutive push channel reconnect attempts.
    pub channel_max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            policies: PolicySet::default(),
            channel_base_delay: crate::channel::DEFAULT_BASE_DELAY,
            channel_max_attempts: crate::channel::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Maps cache keys onto the HTTP read endpoints.
struct ApiFetcher {
    api: Arc<RecordApi>,
}

#[async_trait]
impl RecordFetcher for ApiFetcher {
    async fn fetch(&self, key: &RecordKey) -> Result<CacheValue, FetchError> {
        let value = match key {
            RecordKey::List => CacheValue::List(self.api.fetch_all_records().await?),
            RecordKey::Record(id) => CacheValue::Record(self.api.fetch_record(*id).await?),
            RecordKey::Search(params) => CacheValue::List(self.api.search_records(params).await?),
            RecordKey::Stats => CacheValue::Stats(self.api.fetch_stats().await?),
            RecordKey::History(id) => {
                CacheValue::History(self.api.fetch_approval_history(*id).await?)
            }
        };
        Ok(value)
    }
}

/// Maps mutation operations onto the HTTP write endpoints.
struct ApiMutator {
    api: Arc<RecordApi>,
}

#[async_trait]
impl RecordMutator for ApiMutator {
    async fn update(
        &self,
        id: i64,
        patch: &RecordPatch,
    ) -> Result<EvaluationRecord, MutationError> {
        Ok(self.api.mutate_record(id, patch).await?)
    }

    async fn employee_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        Ok(self.api.apply_employee_approval(id, payload).await?)
    }

    async fn evaluator_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        Ok(self.api.apply_evaluator_approval(id, payload).await?)
    }
}

/// One subscription to one cache key.
///
/// Dropping the subscription releases it; an in-flight fetch for the key is
/// still allowed to complete and populate the cache.
pub struct RecordSubscription {
    guard: SubscriptionGuard,
    store: Arc<EntityStore>,
    scheduler: Arc<RevalidationScheduler>,
}

impl RecordSubscription {
    /// The key this subscription watches.
    pub fn key(&self) -> &RecordKey {
        self.guard.key()
    }

    /// Current `{ data, error, is_loading }` view of the entry.
    pub fn snapshot(&self) -> EntrySnapshot {
        self.store
            .snapshot(self.guard.key())
            .unwrap_or_else(EntrySnapshot::empty)
    }

    /// Explicitly revalidate this key.
    pub async fn refetch(&self) -> Result<(), Arc<FetchError>> {
        self.scheduler
            .revalidate(self.guard.key(), RevalidateTrigger::Explicit)
            .await
    }

    /// Store change events; filter on [`RecordSubscription::key`].
    pub fn updates(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.updates()
    }
}

/// Handle over the whole sync layer.
///
/// Owns the background scheduler and push channel tasks; dropping the client
/// without calling [`SyncClient::shutdown`] aborts them with the runtime.
pub struct SyncClient {
    store: Arc<EntityStore>,
    scheduler: Arc<RevalidationScheduler>,
    engine: MutationEngine,
    channel_status: watch::Receiver<ChannelStatus>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Start a client against the real HTTP and WebSocket backends.
    pub fn start(config: SyncConfig) -> Result<Self, ApiError> {
        let api = Arc::new(RecordApi::from_config(&config.api));
        Self::start_with(
            config,
            Arc::new(ApiFetcher {
                api: Arc::clone(&api),
            }),
            Arc::new(ApiMutator { api }),
            Arc::new(WebSocketTransport),
        )
    }

    /// Start a client over explicit backends. Tests inject fetchers,
    /// mutators and transports here.
    pub fn start_with(
        config: SyncConfig,
        fetcher: Arc<dyn RecordFetcher>,
        mutator: Arc<dyn RecordMutator>,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Self, ApiError> {
        let channel_url = config.api.channel_url()?;

        let store = EntityStore::new();
        let scheduler = RevalidationScheduler::new(Arc::clone(&store), fetcher, config.policies);
        let engine = MutationEngine::new(Arc::clone(&store), Arc::clone(&scheduler), mutator);

        let channel = PushChannel::new(channel_url, Arc::clone(&store), transport)
            .with_backoff(config.channel_base_delay, config.channel_max_attempts);
        let channel_status = channel.status();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler_task = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(scheduler.run(shutdown_rx))
        };

        let channel_task = {
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(channel_error) = channel.run(shutdown_rx).await {
                    error!(error = %channel_error, "push channel terminated");
                }
            })
        };

        let watcher_task = tokio::spawn(reconnect_watcher(
            Arc::clone(&scheduler),
            channel_status.clone(),
            shutdown_rx,
        ));

        info!("sync client started");
        Ok(Self {
            store,
            scheduler,
            engine,
            channel_status,
            shutdown_tx,
            tasks: vec![scheduler_task, channel_task, watcher_task],
        })
    }

    /// The underlying store, for direct snapshot access.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Subscribe to a key and kick off its first fetch.
    pub fn subscribe(&self, key: RecordKey) -> RecordSubscription {
        let guard = self.store.subscribe(&key);
        {
            let scheduler = Arc::clone(&self.scheduler);
            tokio::spawn(async move {
                let _ = scheduler.revalidate(&key, RevalidateTrigger::Explicit).await;
            });
        }
        RecordSubscription {
            guard,
            store: Arc::clone(&self.store),
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    /// Optimistically apply a generic field update.
    pub async fn update_record(
        &self,
        id: i64,
        patch: RecordPatch,
    ) -> Result<EvaluationRecord, MutationError> {
        self.engine.update_record(id, patch).await
    }

    /// Optimistically record the employee's approval and signature.
    pub async fn approve_as_employee(
        &self,
        id: i64,
        payload: SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        self.engine.approve_as_employee(id, payload).await
    }

    /// Optimistically record the evaluator's approval and signature.
    pub async fn approve_as_evaluator(
        &self,
        id: i64,
        payload: SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        self.engine.approve_as_evaluator(id, payload).await
    }

    /// Expire everything and refetch the keys someone is watching. For
    /// cross-cutting reconciliation after out-of-band changes.
    pub async fn revalidate_all(&self) {
        self.store.invalidate(&KeyFilter::Any);
        for key in self.store.subscribed_keys() {
            let _ = self
                .scheduler
                .revalidate(&key, RevalidateTrigger::Explicit)
                .await;
        }
    }

    /// Expire one record and its derived views, refetching the watched ones.
    pub async fn revalidate_record(&self, id: i64) {
        let keys = [
            RecordKey::Record(id),
            RecordKey::History(id),
            RecordKey::List,
            RecordKey::Stats,
        ];
        for key in &keys {
            self.store.invalidate(&KeyFilter::Exact(key.clone()));
        }
        for key in keys {
            let watched = self
                .store
                .snapshot(&key)
                .map(|snap| snap.subscribers > 0)
                .unwrap_or(false);
            if watched {
                let _ = self
                    .scheduler
                    .revalidate(&key, RevalidateTrigger::Explicit)
                    .await;
            }
        }
    }

    /// Forward a window/tab focus event.
    pub fn notify_focus(&self) {
        self.scheduler.notify_focus();
    }

    /// Apply a manually constructed push update through the same code path as
    /// real inbound messages.
    pub fn dispatch_update(&self, update: &PushUpdate) {
        apply_push_update(&self.store, update);
    }

    /// Observe push channel status transitions.
    pub fn channel_status(&self) -> watch::Receiver<ChannelStatus> {
        self.channel_status.clone()
    }

    /// Signal shutdown and wait for the background tasks to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("sync client shut down");
    }
}

/// Revalidates reconnect-sensitive keys whenever the channel comes (back) up.
async fn reconnect_watcher(
    scheduler: Arc<RevalidationScheduler>,
    mut status_rx: watch::Receiver<ChannelStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut was_connected = matches!(*status_rx.borrow(), ChannelStatus::Connected);

    loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = matches!(*status_rx.borrow_and_update(), ChannelStatus::Connected);
                if connected && !was_connected {
                    debug!("push channel up, revalidating reconnect-sensitive keys");
                    scheduler.notify_reconnect();
                }
                was_connected = connected;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
