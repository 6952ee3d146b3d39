//! End-to-end reconciliation against fault-injecting store and cache wrappers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use readzone_core::{
    ActorId, BookId, BookMatch, BookPayload, CanonicalBook, Draft, DraftId, Fingerprint, SyncAction,
};
use readzone_store::{
    DraftFilter, DraftOrder, DraftPatch, DraftStore, DraftTransaction, MemoryCatalog, MemoryStore,
    Seed, StoreError,
};
use readzone_sync::cache::CachedMatch;
use readzone_sync::{
    CacheError, MatchCache, Orchestrator, OrchestratorConfig, Scheduler, SchedulerConfig,
    SyncError, SyncMetrics, perform_sync,
};

const DUNE_ISBN: &str = "9780441013593";

#[derive(Default)]
struct Faults {
    fail: HashSet<DraftId>,
    panic: HashSet<DraftId>,
    find_by_id_delay: Option<Duration>,
    /// The first `find_many` call panics.
    panic_first_find_many: bool,
    /// `find_many` calls after the first `n` sleep for the given duration.
    find_many_delay: Option<(usize, Duration)>,
}

/// Delegates to a [`MemoryStore`], injecting the configured faults.
struct FaultyStore {
    inner: MemoryStore,
    faults: Faults,
    find_many_calls: AtomicUsize,
    find_many_in_flight: AtomicUsize,
    find_many_peak: AtomicUsize,
}

impl FaultyStore {
    fn new(inner: MemoryStore, faults: Faults) -> Self {
        Self {
            inner,
            faults,
            find_many_calls: AtomicUsize::new(0),
            find_many_in_flight: AtomicUsize::new(0),
            find_many_peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DraftStore for FaultyStore {
    async fn find_by_id(&self, id: &DraftId) -> Result<Option<Draft>, StoreError> {
        if self.faults.panic.contains(id) {
            panic!("injected panic loading {id}");
        }
        if self.faults.fail.contains(id) {
            return Err(StoreError::Unavailable(format!("injected failure loading {id}")));
        }
        if let Some(delay) = self.faults.find_by_id_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.find_by_id(id).await
    }

    async fn update_if_version(
        &self,
        id: &DraftId,
        expected_version: i64,
        patch: &DraftPatch,
    ) -> Result<u64, StoreError> {
        self.inner.update_if_version(id, expected_version, patch).await
    }

    async fn find_many(
        &self,
        filter: &DraftFilter,
        order: DraftOrder,
        limit: usize,
    ) -> Result<Vec<Draft>, StoreError> {
        let call = self.find_many_calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 && self.faults.panic_first_find_many {
            panic!("injected panic listing drafts");
        }
        let in_flight = self.find_many_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.find_many_peak.fetch_max(in_flight, Ordering::SeqCst);
        if let Some((after, delay)) = self.faults.find_many_delay
            && call >= after
        {
            tokio::time::sleep(delay).await;
        }
        let result = self.inner.find_many(filter, order, limit).await;
        self.find_many_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn begin(&self) -> Result<Box<dyn DraftTransaction>, StoreError> {
        self.inner.begin().await
    }
}

/// A cache that is down, or that hangs.
enum BrokenCache {
    Failing,
    Hanging,
}

#[async_trait]
impl MatchCache for BrokenCache {
    async fn get(&self, _: &Fingerprint) -> Result<Option<CachedMatch>, CacheError> {
        match self {
            Self::Failing => Err(CacheError::Unavailable("connection refused".into())),
            Self::Hanging => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, _: &Fingerprint, _: Option<BookMatch>) -> Result<(), CacheError> {
        match self {
            Self::Failing => Err(CacheError::Unavailable("connection refused".into())),
            Self::Hanging => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

fn catalog() -> Arc<MemoryCatalog> {
    Arc::new(MemoryCatalog::with_books(vec![CanonicalBook {
        id: BookId::from("b-dune"),
        isbn13: Some(DUNE_ISBN.to_string()),
        title: "Dune".into(),
        authors: vec!["Frank Herbert".into()],
        publisher: None,
    }]))
}

async fn store_with(ids: &[&str]) -> MemoryStore {
    let store = MemoryStore::new();
    for id in ids {
        store
            .insert_draft(Draft::with_payload(
                *id,
                "u1",
                BookPayload::new("Dune").with_isbn(DUNE_ISBN),
            ))
            .await;
    }
    store
}

fn ids(raw: &[&str]) -> Vec<DraftId> {
    raw.iter().map(|s| DraftId::from(*s)).collect()
}

fn config(call_timeout: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        chunk_delay: Duration::ZERO,
        call_timeout,
    }
}

#[tokio::test]
async fn batch_counts_every_candidate_despite_failures() {
    let all = ["d1", "d2", "d3", "d4", "d5"];
    let inner = store_with(&all).await;
    let faults = Faults {
        fail: ids(&["d2", "d4"]).into_iter().collect(),
        ..Faults::default()
    };
    let store = Arc::new(FaultyStore::new(inner.clone(), faults));
    let metrics = Arc::new(SyncMetrics::new());
    let orchestrator = Orchestrator::new(store, catalog())
        .with_metrics(metrics.clone())
        .with_config(config(Duration::from_secs(10)));

    let report = orchestrator.batch_sync(&ids(&all), 2).await;

    assert_eq!(report.processed, 5);
    assert_eq!(report.synced, 3);
    assert_eq!(report.failed, 2);
    let failed: HashSet<&str> = report.errors.iter().map(|e| e.draft_id.as_str()).collect();
    assert_eq!(failed, HashSet::from(["d2", "d4"]));
    assert_eq!(inner.audit_log().await.len(), 3);

    let snap = metrics.snapshot();
    assert_eq!((snap.synced, snap.failed), (3, 2));
}

#[tokio::test]
async fn panicking_draft_is_reported_and_batch_continues() {
    let all = ["ok1", "boom", "ok2"];
    let inner = store_with(&all).await;
    let faults = Faults {
        panic: ids(&["boom"]).into_iter().collect(),
        ..Faults::default()
    };
    let store = Arc::new(FaultyStore::new(inner, faults));
    let metrics = Arc::new(SyncMetrics::new());
    let orchestrator = Orchestrator::new(store, catalog())
        .with_metrics(metrics.clone())
        .with_config(config(Duration::from_secs(10)));

    let report = orchestrator.batch_sync(&ids(&all), 10).await;

    assert_eq!(report.processed, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].draft_id, DraftId::from("boom"));
    assert!(report.errors[0].message.contains("panicked"));

    let snap = metrics.snapshot();
    assert_eq!((snap.synced, snap.failed, snap.total), (2, 1, 3));
    assert_eq!(snap.success_rate(), Some(2.0 / 3.0));
}

#[tokio::test]
async fn failing_cache_falls_back_to_matcher() {
    let store = store_with(&["d1"]).await;
    let metrics = Arc::new(SyncMetrics::new());
    let orchestrator = Orchestrator::new(Arc::new(store), catalog())
        .with_cache(Arc::new(BrokenCache::Failing))
        .with_metrics(metrics.clone());

    let outcome = orchestrator.sync_draft_book(&DraftId::from("d1")).await;

    assert_eq!(outcome.action, SyncAction::Synced);
    assert_eq!(outcome.book_id, Some(BookId::from("b-dune")));
    assert_eq!(metrics.snapshot().cache_misses, 1);
}

#[tokio::test(start_paused = true)]
async fn hanging_cache_times_out_into_a_miss() {
    let store = store_with(&["d1"]).await;
    let orchestrator = Orchestrator::new(Arc::new(store), catalog())
        .with_cache(Arc::new(BrokenCache::Hanging))
        .with_config(config(Duration::from_secs(2)));

    let outcome = orchestrator.sync_draft_book(&DraftId::from("d1")).await;

    assert_eq!(outcome.action, SyncAction::Synced);
    assert!(outcome.duration < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn slow_store_call_times_out() {
    let inner = store_with(&["d1"]).await;
    let faults = Faults {
        find_by_id_delay: Some(Duration::from_secs(60)),
        ..Faults::default()
    };
    let orchestrator = Orchestrator::new(Arc::new(FaultyStore::new(inner.clone(), faults)), catalog())
        .with_config(config(Duration::from_secs(5)));

    let outcome = orchestrator.sync_draft_book(&DraftId::from("d1")).await;

    assert_eq!(outcome.action, SyncAction::Failed);
    assert!(matches!(
        outcome.error,
        Some(SyncError::Timeout {
            operation: "find_by_id"
        })
    ));
    assert!(inner.audit_log().await.is_empty());
}

#[tokio::test]
async fn concurrent_binds_on_one_version_yield_one_conflict() {
    let store = Arc::new(store_with(&["d1"]).await);
    let actor = ActorId::from("u1");
    let draft_id = DraftId::from("d1");

    let attempts = (0..2).map(|i| {
        let store = Arc::clone(&store);
        let actor = actor.clone();
        let draft_id = draft_id.clone();
        tokio::spawn(async move {
            let book = BookId::from(format!("b{i}"));
            perform_sync(store.as_ref(), &draft_id, &book, 0, &actor).await
        })
    });
    let results: Vec<Result<i64, SyncError>> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let wins = results.iter().filter(|r| matches!(r, Ok(1))).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(SyncError::Conflict { expected_version: 0, .. })))
        .count();
    assert_eq!((wins, conflicts), (1, 1));

    let draft = store.find_by_id(&draft_id).await.unwrap().unwrap();
    assert_eq!(draft.version, 1);
    assert!(draft.payload.is_none());
    assert_eq!(store.audit_log().await.len(), 1);
}

#[tokio::test]
async fn already_resolved_draft_is_reported_synced_without_a_write() {
    let store = store_with(&["d1"]).await;
    let orchestrator = Orchestrator::new(Arc::new(store.clone()), catalog());
    let id = DraftId::from("d1");

    assert_eq!(orchestrator.sync_draft_book(&id).await.action, SyncAction::Synced);
    let again = orchestrator.sync_draft_book(&id).await;

    assert_eq!(again.action, SyncAction::Synced);
    assert_eq!(again.book_id, Some(BookId::from("b-dune")));
    assert!(again.match_type.is_none());
    assert_eq!(store.audit_log().await.len(), 1);
}

fn stuck_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        sync_interval_minutes: 30,
        initial_delay: Duration::from_secs(60),
        ..SchedulerConfig::default()
    }
}

/// A scheduler whose second cycle blocks in candidate discovery for hours.
async fn stuck_scheduler() -> (Arc<FaultyStore>, Scheduler) {
    let faults = Faults {
        find_many_delay: Some((1, Duration::from_secs(5 * 3600))),
        ..Faults::default()
    };
    let store = Arc::new(FaultyStore::new(MemoryStore::new(), faults));
    let orchestrator = Orchestrator::new(store.clone(), catalog())
        .with_config(config(Duration::from_secs(24 * 3600)));
    let scheduler = Scheduler::new(orchestrator, stuck_scheduler_config());
    (store, scheduler)
}

#[tokio::test(start_paused = true)]
async fn manual_trigger_during_a_cycle_reports_already_running() {
    let (store, scheduler) = stuck_scheduler().await;
    assert!(scheduler.start(stuck_scheduler_config()).await);

    // First cycle at 1 min is quick; the one at 30 min hangs.
    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    assert!(scheduler.stats().await.cycle_in_progress);

    for _ in 0..3 {
        let result = scheduler.trigger_manual_sync().await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("sync already running"));
    }

    // Ticks at 60 and 90 min fall while the cycle is still running.
    tokio::time::sleep(Duration::from_secs(90 * 60)).await;
    assert_eq!(store.find_many_peak.load(Ordering::SeqCst), 1);
    assert_eq!(store.find_many_calls.load(Ordering::SeqCst), 2);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stuck_cycle_turns_scheduler_unhealthy() {
    let (_store, scheduler) = stuck_scheduler().await;
    scheduler.start(stuck_scheduler_config()).await;

    tokio::time::sleep(Duration::from_secs(40 * 60)).await;
    assert!(scheduler.is_healthy().await);
    assert_eq!(scheduler.stats().await.stats.skipped_runs, 1);

    // Last activity was at 1 min; 1.5 intervals later is 46 min.
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(!scheduler.is_healthy().await);
    scheduler.stop().await;
}

#[tokio::test]
async fn seeded_stores_reconcile_end_to_end() {
    let seed = Seed::from_json(
        r#"{
            "books": [
                {"id": "b1", "isbn13": "9780441013593", "title": "Dune", "authors": ["Frank Herbert"]},
                {"id": "b2", "title": "The Left Hand of Darkness", "authors": ["Ursula K. Le Guin"]}
            ],
            "drafts": [
                {"id": "d1", "owner_id": "u1", "payload": {"title": "dune", "isbn": "978-0-441-01359-3"}},
                {"id": "d2", "owner_id": "u2", "payload": {"title": "Left Hand of Darkness", "authors": ["Le Guin"]}},
                {"id": "d3", "owner_id": "u3", "payload": {"title": "A Book Nobody Has Catalogued"}},
                {"id": "d4", "owner_id": "u4", "resolved_book_id": "b1"}
            ]
        }"#,
    )
    .unwrap();
    let (store, catalog) = seed.into_memory().await;
    let orchestrator = Orchestrator::new(Arc::new(store.clone()), Arc::new(catalog))
        .with_config(config(Duration::from_secs(10)));

    let candidates = orchestrator.discover_candidates(100, None).await.unwrap();
    assert_eq!(candidates.len(), 3);

    let report = orchestrator.batch_sync(&candidates, 2).await;
    assert_eq!(report.processed, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.no_match, 1);
    assert_eq!(report.failed, 0);

    let d2 = store.find_by_id(&DraftId::from("d2")).await.unwrap().unwrap();
    assert_eq!(d2.resolved_book_id, Some(BookId::from("b2")));
    assert!(orchestrator.discover_candidates(100, None).await.unwrap() == vec![DraftId::from("d3")]);
}

fn panicking_discovery_scheduler() -> (Arc<FaultyStore>, Scheduler) {
    let faults = Faults {
        panic_first_find_many: true,
        ..Faults::default()
    };
    let store = Arc::new(FaultyStore::new(MemoryStore::new(), faults));
    let orchestrator = Orchestrator::new(store.clone(), catalog())
        .with_config(config(Duration::from_secs(10)));
    let scheduler = Scheduler::new(orchestrator, stuck_scheduler_config());
    (store, scheduler)
}

#[tokio::test(start_paused = true)]
async fn scheduler_keeps_ticking_after_a_panicking_cycle() {
    let (store, scheduler) = panicking_discovery_scheduler();
    scheduler.start(stuck_scheduler_config()).await;

    // The cycle at 1 min panics in discovery.
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    let snap = scheduler.stats().await;
    assert!(snap.active);
    assert!(!snap.cycle_in_progress);
    assert_eq!(snap.stats.total_runs, 1);
    assert_eq!(snap.stats.successful_runs, 0);
    assert!(scheduler.is_healthy().await);

    // Ticks every 30 min keep running afterwards.
    tokio::time::sleep(Duration::from_secs(10 * 3600)).await;
    let calls = store.find_many_calls.load(Ordering::SeqCst);
    assert_eq!(calls, 21);
    let snap = scheduler.stats().await;
    assert!(snap.active);
    assert_eq!(snap.stats.skipped_runs, 20);
    assert!(scheduler.is_healthy().await);
    scheduler.stop().await;
}

#[tokio::test]
async fn manual_trigger_reports_a_panicking_cycle() {
    let (_store, scheduler) = panicking_discovery_scheduler();

    let result = scheduler.trigger_manual_sync().await;
    assert!(!result.success);
    assert!(result.error.as_deref().is_some_and(|e| e.contains("panicked")));
    assert!(!scheduler.stats().await.cycle_in_progress);

    let again = scheduler.trigger_manual_sync().await;
    assert!(again.success);
    assert_eq!(scheduler.stats().await.stats.total_runs, 2);
}
