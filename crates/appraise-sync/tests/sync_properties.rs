//! Integration tests for the sync layer's core guarantees: request
//! deduplication, stale-while-revalidate, optimistic convergence, push
//! splices, cascade invalidation and reconnect backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::sync::{Semaphore, watch};

use appraise_api::{
    ApiConfig, ApiError, ApprovalStatus, EvaluationRecord, RecordPatch, SignaturePayload,
};
use appraise_sync::{
    CacheValue, ChannelError, ChannelEvent, ChannelStatus, EntityStore, FetchError, KeyFilter,
    MutationEngine, MutationError, PolicySet, PushChannel, PushConnection, PushTransport,
    PushUpdate, RecordFetcher, RecordKey, RecordMutator, RevalidateTrigger, RevalidationPolicy,
    RevalidationScheduler, SyncClient, SyncConfig, apply_push_update,
};

/// Opt-in log output for debugging test runs (`RUST_LOG=appraise_sync=trace`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn record(id: i64, status: ApprovalStatus) -> EvaluationRecord {
    EvaluationRecord {
        id,
        employee: format!("employee-{}", id),
        evaluator: "Priya Nair".to_string(),
        period: Some("2026-H1".to_string()),
        summary: None,
        approval_status: status,
        employee_signature: None,
        evaluator_signature: None,
        employee_approved_at: None,
        evaluator_approved_at: None,
        created_at: Utc::now(),
        last_modified: Utc::now(),
        extra: serde_json::Map::new(),
    }
}

fn signature(signed_by: &str) -> SignaturePayload {
    SignaturePayload {
        signature: "sig".to_string(),
        signed_by: signed_by.to_string(),
        note: None,
    }
}

/// In-memory backend acting as server truth for both reads and writes.
struct MockBackend {
    records: Mutex<Vec<EvaluationRecord>>,
    list_fetches: AtomicUsize,
    record_fetches: AtomicUsize,
    stats_fetches: AtomicUsize,
    history_fetches: AtomicUsize,
    fail_fetches: AtomicBool,
    fail_mutations: AtomicBool,
    /// Mutations block on this; tests gate settling by withholding permits.
    mutation_gate: Semaphore,
    /// How long each fetch takes, so concurrent fetches genuinely overlap.
    fetch_delay: Duration,
}

impl MockBackend {
    fn new(records: Vec<EvaluationRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            list_fetches: AtomicUsize::new(0),
            record_fetches: AtomicUsize::new(0),
            stats_fetches: AtomicUsize::new(0),
            history_fetches: AtomicUsize::new(0),
            fail_fetches: AtomicBool::new(false),
            fail_mutations: AtomicBool::new(false),
            mutation_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            fetch_delay: Duration::from_millis(10),
        })
    }

    fn gated(records: Vec<EvaluationRecord>) -> Arc<Self> {
        let backend = Self::new(records);
        let backend = Arc::into_inner(backend).expect("fresh backend");
        Arc::new(Self {
            mutation_gate: Semaphore::new(0),
            ..backend
        })
    }

    fn server_record(&self, id: i64) -> Option<EvaluationRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    fn commit(&self, updated: EvaluationRecord) -> EvaluationRecord {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.id == updated.id) {
            Some(slot) => *slot = updated.clone(),
            None => records.push(updated.clone()),
        }
        updated
    }

    async fn mutate(
        &self,
        id: i64,
        apply: impl FnOnce(EvaluationRecord) -> EvaluationRecord,
    ) -> Result<EvaluationRecord, MutationError> {
        let permit = self.mutation_gate.acquire().await.expect("gate closed");
        permit.forget();
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(MutationError(ApiError::Status {
                status: 409,
                message: "rejected".to_string(),
            }));
        }
        let current = self
            .server_record(id)
            .unwrap_or_else(|| record(id, ApprovalStatus::Pending));
        Ok(self.commit(apply(current)))
    }
}

#[async_trait]
impl RecordFetcher for MockBackend {
    async fn fetch(&self, key: &RecordKey) -> Result<CacheValue, FetchError> {
        tokio::time::sleep(self.fetch_delay).await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(FetchError(ApiError::Status {
                status: 503,
                message: "unavailable".to_string(),
            }));
        }
        let records = self.records.lock().unwrap().clone();
        Ok(match key {
            RecordKey::List | RecordKey::Search(_) => {
                self.list_fetches.fetch_add(1, Ordering::SeqCst);
                CacheValue::List(records)
            }
            RecordKey::Record(id) => {
                self.record_fetches.fetch_add(1, Ordering::SeqCst);
                let found = records.into_iter().find(|r| r.id == *id).ok_or_else(|| {
                    FetchError(ApiError::Status {
                        status: 404,
                        message: "not found".to_string(),
                    })
                })?;
                CacheValue::Record(found)
            }
            RecordKey::Stats => {
                self.stats_fetches.fetch_add(1, Ordering::SeqCst);
                let mut stats = appraise_api::RecordStats {
                    total: records.len() as u64,
                    ..Default::default()
                };
                for r in &records {
                    match r.approval_status {
                        ApprovalStatus::Pending => stats.pending += 1,
                        ApprovalStatus::EmployeeApproved => stats.employee_approved += 1,
                        ApprovalStatus::FullyApproved => stats.fully_approved += 1,
                    }
                }
                CacheValue::Stats(stats)
            }
            RecordKey::History(_) => {
                self.history_fetches.fetch_add(1, Ordering::SeqCst);
                CacheValue::History(vec![])
            }
        })
    }
}

#[async_trait]
impl RecordMutator for MockBackend {
    async fn update(&self, id: i64, patch: &RecordPatch) -> Result<EvaluationRecord, MutationError> {
        let patch = patch.clone();
        self.mutate(id, move |current| current.with_patch(&patch)).await
    }

    async fn employee_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        let payload = payload.clone();
        self.mutate(id, move |current| current.with_employee_approval(&payload))
            .await
    }

    async fn evaluator_approval(
        &self,
        id: i64,
        payload: &SignaturePayload,
    ) -> Result<EvaluationRecord, MutationError> {
        let payload = payload.clone();
        self.mutate(id, move |current| current.with_evaluator_approval(&payload))
            .await
    }
}

/// Policies tuned for tests: no polling noise, tight retry timing.
fn test_policies() -> PolicySet {
    let base = RevalidationPolicy {
        refresh_interval: None,
        revalidate_on_focus: true,
        revalidate_on_reconnect: true,
        deduping_interval: Duration::from_millis(500),
        max_retries: 2,
        retry_backoff: Duration::from_millis(5),
    };
    PolicySet {
        list: base.clone(),
        record: base.clone(),
        search: base.clone(),
        stats: base.clone(),
        history: base,
    }
}

struct Harness {
    store: Arc<EntityStore>,
    scheduler: Arc<RevalidationScheduler>,
    engine: MutationEngine,
    backend: Arc<MockBackend>,
}

impl Harness {
    fn new(backend: Arc<MockBackend>) -> Self {
        let store = EntityStore::new();
        let scheduler = RevalidationScheduler::new(
            Arc::clone(&store),
            backend.clone(),
            test_policies(),
        );
        let engine = MutationEngine::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            backend.clone(),
        );
        Self {
            store,
            scheduler,
            engine,
            backend,
        }
    }

    async fn revalidate(&self, key: &RecordKey) -> Result<(), Arc<FetchError>> {
        self.scheduler
            .revalidate(key, RevalidateTrigger::Explicit)
            .await
    }

    fn cached_list(&self) -> Vec<EvaluationRecord> {
        self.store
            .snapshot(&RecordKey::List)
            .and_then(|s| s.value)
            .and_then(|v| v.as_list().map(|l| l.to_vec()))
            .unwrap_or_default()
    }

    fn cached_record(&self, id: i64) -> Option<EvaluationRecord> {
        self.store
            .snapshot(&RecordKey::Record(id))
            .and_then(|s| s.value)
            .and_then(|v| v.as_record().cloned())
    }
}

// P1: N concurrent demands for one key produce exactly one network fetch.
#[tokio::test]
async fn concurrent_subscribers_share_one_fetch() {
    let harness = Arc::new(Harness::new(MockBackend::new(vec![record(
        1,
        ApprovalStatus::Pending,
    )])));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let harness = Arc::clone(&harness);
        tasks.push(tokio::spawn(async move {
            harness.revalidate(&RecordKey::List).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(harness.backend.list_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(harness.cached_list().len(), 1);
}

// P2: a failed revalidation sets the error and never clears the data.
#[tokio::test]
async fn failed_revalidation_keeps_last_known_good() {
    let harness = Harness::new(MockBackend::new(vec![record(1, ApprovalStatus::Pending)]));

    harness.revalidate(&RecordKey::List).await.unwrap();
    assert_eq!(harness.cached_list().len(), 1);

    harness.backend.fail_fetches.store(true, Ordering::SeqCst);
    harness
        .store
        .invalidate(&KeyFilter::Exact(RecordKey::List));
    let result = harness.revalidate(&RecordKey::List).await;

    assert!(result.is_err());
    let snap = harness.store.snapshot(&RecordKey::List).unwrap();
    assert!(snap.error.is_some(), "error surfaced to subscribers");
    assert_eq!(
        harness.cached_list().len(),
        1,
        "stale data preserved through the failure"
    );

    // recovery clears the error
    harness.backend.fail_fetches.store(false, Ordering::SeqCst);
    harness
        .store
        .invalidate(&KeyFilter::Exact(RecordKey::List));
    harness.revalidate(&RecordKey::List).await.unwrap();
    assert!(harness.store.snapshot(&RecordKey::List).unwrap().error.is_none());
}

// P3: the speculative value is visible before the mutation settles, and the
// cache converges to server truth afterwards.
#[tokio::test]
async fn optimistic_value_shows_immediately_then_converges() {
    let backend = MockBackend::gated(vec![record(1, ApprovalStatus::Pending)]);
    let harness = Arc::new(Harness::new(backend.clone()));

    harness.revalidate(&RecordKey::Record(1)).await.unwrap();

    let mutation = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move {
            harness
                .engine
                .approve_as_employee(1, signature("employee-1"))
                .await
        })
    };

    // let the mutation task run to its first await (the gated network call)
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        harness.cached_record(1).unwrap().approval_status,
        ApprovalStatus::EmployeeApproved,
        "speculative value visible before the network call resolves"
    );

    backend.mutation_gate.add_permits(1);
    mutation.await.unwrap().unwrap();

    harness.revalidate(&RecordKey::Record(1)).await.unwrap();
    let cached = harness.cached_record(1).unwrap();
    let server = backend.server_record(1).unwrap();
    assert_eq!(cached, server, "post-settle cache equals server truth");
}

// P3, failure leg: a rejected mutation must not leave a diverged value.
#[tokio::test]
async fn rejected_mutation_converges_to_server_truth() {
    let backend = MockBackend::new(vec![record(1, ApprovalStatus::Pending)]);
    backend.fail_mutations.store(true, Ordering::SeqCst);
    let harness = Harness::new(backend.clone());

    harness.revalidate(&RecordKey::Record(1)).await.unwrap();
    let result = harness
        .engine
        .approve_as_employee(1, signature("employee-1"))
        .await;
    assert!(result.is_err(), "rejection propagates to the caller");

    harness.revalidate(&RecordKey::Record(1)).await.unwrap();
    assert_eq!(
        harness.cached_record(1).unwrap().approval_status,
        ApprovalStatus::Pending,
        "server truth restored after rollback"
    );
}

// P4: a created push for a known id updates in place, never duplicates.
#[tokio::test]
async fn push_created_updates_in_place() {
    let harness = Harness::new(MockBackend::new(vec![
        record(1, ApprovalStatus::Pending),
        record(2, ApprovalStatus::Pending),
    ]));
    harness.revalidate(&RecordKey::List).await.unwrap();

    apply_push_update(
        &harness.store,
        &PushUpdate::Created {
            record: record(1, ApprovalStatus::EmployeeApproved),
            timestamp: Utc::now(),
        },
    );

    let list = harness.cached_list();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, 1);
    assert_eq!(list[0].approval_status, ApprovalStatus::EmployeeApproved);
}

// P5: a created push for an unknown id appends exactly one entry.
#[tokio::test]
async fn push_created_appends_exactly_one() {
    let harness = Harness::new(MockBackend::new(vec![record(1, ApprovalStatus::Pending)]));
    harness.revalidate(&RecordKey::List).await.unwrap();

    apply_push_update(
        &harness.store,
        &PushUpdate::Created {
            record: record(3, ApprovalStatus::Pending),
            timestamp: Utc::now(),
        },
    );

    let list = harness.cached_list();
    assert_eq!(list.len(), 2);
    assert_eq!(list[1].id, 3);
}

// P6: pushes cascade staleness into the derived views, and the next read
// refetches each exactly once.
#[tokio::test]
async fn push_cascades_one_refetch_of_derived_views() {
    let harness = Harness::new(MockBackend::new(vec![record(1, ApprovalStatus::Pending)]));
    harness.revalidate(&RecordKey::Stats).await.unwrap();
    harness.revalidate(&RecordKey::History(1)).await.unwrap();
    let stats_before = harness.backend.stats_fetches.load(Ordering::SeqCst);
    let history_before = harness.backend.history_fetches.load(Ordering::SeqCst);

    apply_push_update(
        &harness.store,
        &PushUpdate::ApprovalAdded {
            record: record(1, ApprovalStatus::EmployeeApproved),
            timestamp: Utc::now(),
        },
    );
    assert!(harness.store.is_stale(&RecordKey::Stats));
    assert!(harness.store.is_stale(&RecordKey::History(1)));

    // two back-to-back reads per key: the second is absorbed by dedup
    for _ in 0..2 {
        harness.revalidate(&RecordKey::Stats).await.unwrap();
        harness.revalidate(&RecordKey::History(1)).await.unwrap();
    }

    assert_eq!(
        harness.backend.stats_fetches.load(Ordering::SeqCst),
        stats_before + 1
    );
    assert_eq!(
        harness.backend.history_fetches.load(Ordering::SeqCst),
        history_before + 1
    );
}

// P7: reconnect delays are linear and bounded; exhaustion is terminal.
// (Covered at the transport level in the channel module's own tests; here the
// full client wiring is exercised end-to-end.)
#[tokio::test(start_paused = true)]
async fn reconnect_backoff_is_bounded_and_terminal() {
    struct RefusingTransport {
        connects: Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl PushTransport for RefusingTransport {
        async fn connect(&self, _url: &str) -> Result<Box<dyn PushConnection>, ChannelError> {
            self.connects.lock().unwrap().push(tokio::time::Instant::now());
            Err(ChannelError::Connect("refused".to_string()))
        }
    }

    let transport = Arc::new(RefusingTransport {
        connects: Mutex::new(Vec::new()),
    });
    let store = EntityStore::new();
    let channel = PushChannel::new("ws://test", store, transport.clone())
        .with_backoff(Duration::from_secs(1), 3);
    let status = channel.status();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = channel.run(shutdown_rx).await;

    assert!(matches!(result, Err(ChannelError::Exhausted { attempts: 3 })));
    assert_eq!(*status.borrow(), ChannelStatus::Offline, "terminal state");

    let connects = transport.connects.lock().unwrap().clone();
    assert_eq!(connects.len(), 3, "no attempts scheduled past the cap");
    let gaps: Vec<Duration> = connects.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "delays non-decreasing");
    assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);

    // nothing further fires even as time passes
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connects.lock().unwrap().len(), 3);
}

// Scenario: subscribe to the list, approve as evaluator, observe the
// immediate speculative value, then the exact server truth after settle.
#[tokio::test]
async fn evaluator_approval_scenario() {
    init_tracing();
    let backend = MockBackend::gated(vec![record(1, ApprovalStatus::Pending)]);
    let harness = Arc::new(Harness::new(backend.clone()));

    let _subscription = harness.store.subscribe(&RecordKey::List);
    harness.revalidate(&RecordKey::List).await.unwrap();
    assert_eq!(
        harness.cached_list()[0].approval_status,
        ApprovalStatus::Pending
    );

    let mutation = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move {
            harness
                .engine
                .approve_as_evaluator(1, signature("Priya Nair"))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let speculative = harness.cached_list()[0].clone();
    assert_eq!(speculative.approval_status, ApprovalStatus::FullyApproved);
    assert_eq!(speculative.evaluator_signature.as_deref(), Some("sig"));

    backend.mutation_gate.add_permits(1);
    let settled = mutation.await.unwrap().unwrap();
    assert_eq!(settled.approval_status, ApprovalStatus::FullyApproved);
    assert_eq!(settled.evaluator_signature.as_deref(), Some("sig"));

    harness.revalidate(&RecordKey::List).await.unwrap();
    assert_eq!(
        harness.cached_list(),
        vec![backend.server_record(1).unwrap()],
        "post-settle cached value matches server truth exactly"
    );
}

// Full client wiring: subscribing fetches, pushes splice, reconnects
// revalidate, shutdown is clean.
#[tokio::test]
async fn sync_client_end_to_end() {
    init_tracing();
    struct SessionTransport {
        sessions: Mutex<VecDeque<Vec<ChannelEvent>>>,
        connects: AtomicUsize,
    }

    struct SessionConnection {
        events: VecDeque<ChannelEvent>,
    }

    #[async_trait]
    impl PushConnection for SessionConnection {
        async fn next_event(&mut self) -> Result<ChannelEvent, ChannelError> {
            match self.events.pop_front() {
                Some(event) => {
                    // space events out so the consumer keeps up
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(event)
                }
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl PushTransport for SessionTransport {
        async fn connect(&self, _url: &str) -> Result<Box<dyn PushConnection>, ChannelError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front() {
                Some(events) => Ok(Box::new(SessionConnection {
                    events: events.into(),
                })),
                None => Err(ChannelError::Connect("refused".to_string())),
            }
        }
    }

    let pushed = record(7, ApprovalStatus::Pending);
    let push_payload = serde_json::json!({
        "kind": "created",
        "record": serde_json::to_value(&pushed).unwrap(),
        "timestamp": Utc::now(),
    })
    .to_string();

    let transport = Arc::new(SessionTransport {
        sessions: Mutex::new(VecDeque::from(vec![
            // first session: one push, then abnormal drop
            vec![
                ChannelEvent::Text(push_payload),
                ChannelEvent::Closed { clean: false },
            ],
            // second session: stays open until shutdown
            vec![],
        ])),
        connects: AtomicUsize::new(0),
    });

    // server truth also carries the pushed record, so a reconnect refetch
    // agrees with the splice
    let backend = MockBackend::new(vec![record(1, ApprovalStatus::Pending)]);
    backend.commit(pushed.clone());
    let config = SyncConfig {
        api: ApiConfig::new("http://localhost:8000/api"),
        policies: test_policies(),
        channel_base_delay: Duration::from_millis(20),
        channel_max_attempts: 5,
    };
    let client = SyncClient::start_with(config, backend.clone(), backend.clone(), transport.clone())
        .expect("client starts");

    let subscription = client.subscribe(RecordKey::List);
    let mut status = client.channel_status();

    // wait for the second session (post-reconnect) to be live
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if transport.connects.load(Ordering::SeqCst) >= 2
                && *status.borrow() == ChannelStatus::Connected
            {
                break;
            }
            let _ = status.changed().await;
        }
    })
    .await
    .expect("channel reconnected");

    // give the subscription fetch and push splice time to land
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snap = subscription.snapshot();
            let ids: Vec<i64> = snap
                .value
                .as_ref()
                .and_then(|v| v.as_list())
                .map(|l| l.iter().map(|r| r.id).collect())
                .unwrap_or_default();
            if ids.contains(&1) && ids.contains(&7) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("list contains fetched and pushed records");

    // manual dispatch flows through the identical path
    client.dispatch_update(&PushUpdate::Deleted {
        record: pushed,
        timestamp: Utc::now(),
    });
    let ids: Vec<i64> = subscription
        .snapshot()
        .value
        .as_ref()
        .and_then(|v| v.as_list())
        .map(|l| l.iter().map(|r| r.id).collect())
        .unwrap_or_default();
    assert_eq!(ids, vec![1]);

    client.shutdown().await;
}
