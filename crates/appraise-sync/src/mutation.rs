//! Optimistic mutations: apply locally, confirm or roll back on settle.
//!
//! Each attempt moves through `Idle -> Applying -> {Committing | RollingBack}
//! -> Settled`. The speculative value is spliced in before the network call
//! starts, so the UI reflects the change with zero latency; revalidation
//! after settle reconciles the cache with server truth either way.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use appraise_api::{EvaluationRecord, RecordPatch, SignaturePayload};

use crate::dispatch::{set_single, update_list_entry};
use crate::error::MutationError;
use crate::key::{KeyFilter, RecordKey};
use crate::scheduler::{RevalidateTrigger, RevalidationScheduler};
use crate::store::{CacheValue, EntityStore};

/// Phase of one mutation attempt, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Idle,
    Applying,
    Committing,
    RollingBack,
    Settled,
}

/// The write operations the engine issues against the backend.
#[async_trait]
pub trait RecordMutator: Send + Sync {
    async fn update(&self, id: i64, patch: &RecordPatch)
    -> Result<EvaluationRecord, MutationError>;

    async fn employee_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError>;

    async fn evaluator_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError>;
}

/// Applies speculative updates and reconciles them when the real mutation
/// settles.
///
/// The engine is agnostic to which business operation runs; each entry point
/// supplies a pure speculative function over the current cached record and
/// the network call to issue.
pub struct MutationEngine {
    store: Arc<EntityStore>,
    scheduler: Arc<RevalidationScheduler>,
    mutator: Arc<dyn RecordMutator>,
}

impl MutationEngine {
    pub fn new(
        store: Arc<EntityStore>,
        scheduler: Arc<RevalidationScheduler>,
        mutator: Arc<dyn RecordMutator>,
    ) -> Self {
        Self {
            store,
            scheduler,
            mutator,
        }
    }

    /// Generic field update.
    pub async fn update_record(
        &self,
        id: i64,
        patch: RecordPatch,
    ) -> Result<EvaluationRecord, MutationError> {
        let speculative = {
            let patch = patch.clone();
            move |record: &EvaluationRecord| record.with_patch(&patch)
        };
        self.run(id, speculative, || self.mutator.update(id, &patch))
            .await
    }

    /// Employee approval with signature: advances the record to
    /// `employee_approved`.
    pub async fn approve_as_employee(
        &self,
        id: i64,
        payload: SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        let speculative = {
            let payload = payload.clone();
            move |record: &EvaluationRecord| record.with_employee_approval(&payload)
        };
        self.run(id, speculative, || {
            self.mutator.employee_approval(id, &payload)
        })
        .await
    }

    /// Evaluator approval with signature: advances the record to the terminal
    /// `fully_approved` state.
    pub async fn approve_as_evaluator(
        &self,
        id: i64,
        payload: SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        let speculative = {
            let payload = payload.clone();
            move |record: &EvaluationRecord| record.with_evaluator_approval(&payload)
        };
        self.run(id, speculative, || {
            self.mutator.evaluator_approval(id, &payload)
        })
        .await
    }

    /// Run one optimistic mutation attempt.
    async fn run<S, Op, Fut>(
        &self,
        id: i64,
        speculative: S,
        op: Op,
    ) -> Result<EvaluationRecord, MutationError>
    where
        S: Fn(&EvaluationRecord) -> EvaluationRecord,
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<EvaluationRecord, MutationError>>,
    {
        // Applying: splice the speculative value in before the network call.
        // The speculative function runs on whatever is currently cached,
        // including an earlier mutation's still-speculative value.
        let prior = self.cached_record(id);
        let speculative_value = prior.as_ref().map(&speculative);
        if let Some(next) = &speculative_value {
            debug!(id, phase = ?MutationPhase::Applying, "applying speculative value");
            set_single(&self.store, next);
            update_list_entry(&self.store, next);
        }

        let result = op().await;

        match &result {
            Ok(_) => {
                debug!(id, phase = ?MutationPhase::Committing, "mutation confirmed");
            }
            Err(error) => {
                warn!(id, phase = ?MutationPhase::RollingBack, error = %error, "mutation rejected");
                // Restore the prior snapshot only if our speculative value is
                // still what is cached; a later overlapping mutation owns the
                // entry otherwise. Revalidation below stays authoritative.
                if let (Some(prior), Some(speculated)) = (&prior, &speculative_value)
                    && self.cached_record(id).as_ref() == Some(speculated)
                {
                    set_single(&self.store, prior);
                    update_list_entry(&self.store, prior);
                }
            }
        }

        // Settled: reconcile with server truth regardless of outcome.
        self.reconcile(id);
        debug!(id, phase = ?MutationPhase::Settled, "mutation settled");
        result
    }

    /// The currently cached record for `id`, from the single-record entry or
    /// the list.
    fn cached_record(&self, id: i64) -> Option<EvaluationRecord> {
        if let Some(record) = self
            .store
            .snapshot(&RecordKey::Record(id))
            .and_then(|snap| snap.value)
            .as_ref()
            .and_then(CacheValue::as_record)
        {
            return Some(record.clone());
        }
        self.store
            .snapshot(&RecordKey::List)
            .and_then(|snap| snap.value)
            .as_ref()
            .and_then(CacheValue::as_list)
            .and_then(|list| list.iter().find(|r| r.id == id).cloned())
    }

    /// Mark the mutated key and the derived views stale, and immediately
    /// revalidate the ones someone is watching.
    fn reconcile(&self, id: i64) {
        let keys = [RecordKey::Record(id), RecordKey::List, RecordKey::Stats];
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
                let scheduler = Arc::clone(&self.scheduler);
                tokio::spawn(async move {
                    let _ = scheduler.revalidate(&key, RevalidateTrigger::Explicit).await;
                });
            }
        }
    }
}
