//! Per-draft and batch reconciliation entry points.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use readzone_core::{ActorId, BookId, BookMatch, BookPayload, DraftId, Fingerprint, MatchType, SyncAction};
use readzone_store::{CatalogStore, DraftFilter, DraftOrder, DraftStore};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::cache::MatchCache;
use crate::matcher::{MATCH_THRESHOLD, Matcher};
use crate::metrics::{MetricsSink, SyncMetrics};
use crate::transaction::perform_sync;
use crate::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause between batch chunks.
    #[serde(with = "crate::duration::millis")]
    pub chunk_delay: Duration,
    /// Upper bound on any single store or cache call.
    #[serde(with = "crate::duration::secs")]
    pub call_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_delay: Duration::from_millis(100),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of one reconciliation attempt.
#[derive(Debug)]
pub struct SyncOutcome {
    pub draft_id: DraftId,
    pub action: SyncAction,
    pub book_id: Option<BookId>,
    pub match_score: Option<u8>,
    pub match_type: Option<MatchType>,
    pub duration: Duration,
    pub error: Option<SyncError>,
}

impl SyncOutcome {
    pub fn success(&self) -> bool {
        self.action == SyncAction::Synced
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    pub draft_id: DraftId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Always the number of candidates submitted.
    pub processed: usize,
    pub synced: usize,
    pub no_match: usize,
    pub failed: usize,
    #[serde(with = "crate::duration::millis")]
    pub duration: Duration,
    pub errors: Vec<BatchError>,
}

impl BatchReport {
    fn record(&mut self, outcome: SyncOutcome) {
        self.processed += 1;
        match outcome.action {
            SyncAction::Synced => self.synced += 1,
            SyncAction::NoMatch => self.no_match += 1,
            SyncAction::Failed => {
                self.failed += 1;
                let message = outcome
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.errors.push(BatchError {
                    draft_id: outcome.draft_id,
                    message,
                });
            }
        }
    }
}

/// What a successful reconciliation bound the draft to.
struct Resolved {
    book_id: BookId,
    /// `None` when the draft was already resolved.
    book_match: Option<BookMatch>,
}

/// Composes cache, matcher, and transaction engine for one draft, and fans
/// out over many. Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn DraftStore>,
    matcher: Matcher,
    cache: Option<Arc<dyn MatchCache>>,
    metrics: Arc<dyn MetricsSink>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// An orchestrator with no cache and a private [`SyncMetrics`] sink.
    pub fn new(store: Arc<dyn DraftStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            matcher: Matcher::new(catalog),
            cache: None,
            metrics: Arc::new(SyncMetrics::new()),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn MatchCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Reconcile one draft, attributing the write to the draft's owner.
    pub async fn sync_draft_book(&self, draft_id: &DraftId) -> SyncOutcome {
        self.sync_draft_book_as(draft_id, None).await
    }

    /// Reconcile one draft. `actor` overrides the audit attribution.
    ///
    /// Never fails: every error becomes the outcome's `failed` or `no_match`
    /// action, and exactly one outcome is recorded in the metrics sink.
    pub async fn sync_draft_book_as(&self, draft_id: &DraftId, actor: Option<&ActorId>) -> SyncOutcome {
        let start = Instant::now();
        let result = self.reconcile(draft_id, actor).await;

        let mut outcome = SyncOutcome {
            draft_id: draft_id.clone(),
            action: SyncAction::Failed,
            book_id: None,
            match_score: None,
            match_type: None,
            duration: Duration::ZERO,
            error: None,
        };
        match result {
            Ok(resolved) => {
                outcome.action = SyncAction::Synced;
                outcome.book_id = Some(resolved.book_id);
                if let Some(m) = resolved.book_match {
                    outcome.match_score = Some(m.score);
                    outcome.match_type = Some(m.match_type);
                }
            }
            Err(e @ (SyncError::NoPayload(_) | SyncError::NoMatch { .. })) => {
                if let SyncError::NoMatch { best_score } = &e {
                    outcome.match_score = *best_score;
                }
                outcome.action = SyncAction::NoMatch;
                outcome.error = Some(e);
            }
            Err(e) => {
                warn!(draft_id = %draft_id, kind = e.kind(), error = %e, "draft sync failed");
                outcome.error = Some(e);
            }
        }
        outcome.duration = start.elapsed();

        debug!(
            draft_id = %draft_id,
            action = outcome.action.as_str(),
            score = ?outcome.match_score,
            ms = outcome.duration.as_millis() as u64,
            "draft sync finished"
        );
        self.metrics.record_outcome(&outcome);
        outcome
    }

    async fn reconcile(&self, draft_id: &DraftId, actor: Option<&ActorId>) -> Result<Resolved, SyncError> {
        let draft = self
            .within("find_by_id", self.store.find_by_id(draft_id))
            .await??
            .ok_or_else(|| SyncError::NotFound(draft_id.clone()))?;

        if let Some(book_id) = draft.resolved_book_id {
            return Ok(Resolved {
                book_id,
                book_match: None,
            });
        }
        let Some(payload) = draft.payload.as_ref() else {
            return Err(SyncError::NoPayload(draft_id.clone()));
        };

        let book_match = match self.lookup(payload).await? {
            Some(m) if m.score >= MATCH_THRESHOLD => m,
            other => {
                return Err(SyncError::NoMatch {
                    best_score: other.map(|m| m.score),
                });
            }
        };

        let actor = actor.unwrap_or(&draft.owner_id);
        self.within(
            "perform_sync",
            perform_sync(
                self.store.as_ref(),
                draft_id,
                &book_match.book_id,
                draft.version,
                actor,
            ),
        )
        .await??;

        Ok(Resolved {
            book_id: book_match.book_id.clone(),
            book_match: Some(book_match),
        })
    }

    /// Cached match for `payload`, falling back to the matcher on a miss or
    /// any cache failure. Matcher results are written back, negatives included.
    async fn lookup(&self, payload: &BookPayload) -> Result<Option<BookMatch>, SyncError> {
        let fingerprint = Fingerprint::of(payload);

        if let Some(cache) = &self.cache {
            match timeout(self.config.call_timeout, cache.get(&fingerprint)).await {
                Ok(Ok(Some(cached))) => {
                    self.metrics.record_cache_lookup(true);
                    return Ok(cached.book_match);
                }
                Ok(Ok(None)) => self.metrics.record_cache_lookup(false),
                Ok(Err(e)) => {
                    self.metrics.record_cache_lookup(false);
                    warn!(%fingerprint, error = %e, "match cache read failed, matching directly");
                }
                Err(_) => {
                    self.metrics.record_cache_lookup(false);
                    warn!(%fingerprint, "match cache read timed out, matching directly");
                }
            }
        }

        let found = self
            .within("match", self.matcher.find_best(payload))
            .await??;

        if let Some(cache) = &self.cache {
            match timeout(self.config.call_timeout, cache.set(&fingerprint, found.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%fingerprint, error = %e, "match cache write failed"),
                Err(_) => warn!(%fingerprint, "match cache write timed out"),
            }
        }
        Ok(found)
    }

    async fn within<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, SyncError> {
        timeout(self.config.call_timeout, fut).await.map_err(|_| {
            warn!(operation, timeout_ms = self.config.call_timeout.as_millis() as u64, "store call timed out");
            SyncError::Timeout { operation }
        })
    }

    /// Reconcile `draft_ids` in chunks of `batch_size`.
    ///
    /// Drafts within a chunk run concurrently as separate tasks; chunks run
    /// one after another with `chunk_delay` between them. A failing or
    /// panicking draft is recorded in `errors` and never stops the batch.
    pub async fn batch_sync(&self, draft_ids: &[DraftId], batch_size: usize) -> BatchReport {
        let start = Instant::now();
        let batch_size = batch_size.max(1);
        let mut report = BatchReport::default();
        info!(candidates = draft_ids.len(), batch_size, "batch sync starting");

        for (i, chunk) in draft_ids.chunks(batch_size).enumerate() {
            if i > 0 && !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }

            let chunk_start = Instant::now();
            let tasks = chunk.iter().map(|id| {
                let this = self.clone();
                let id = id.clone();
                tokio::spawn(async move { this.sync_draft_book(&id).await })
            });
            let results = join_all(tasks).await;

            for (id, result) in chunk.iter().zip(results) {
                match result {
                    Ok(outcome) => report.record(outcome),
                    Err(join_err) => {
                        warn!(draft_id = %id, error = %join_err, "sync task aborted");
                        let outcome = SyncOutcome {
                            draft_id: id.clone(),
                            action: SyncAction::Failed,
                            book_id: None,
                            match_score: None,
                            match_type: None,
                            duration: chunk_start.elapsed(),
                            error: Some(SyncError::Panicked(join_err.to_string())),
                        };
                        self.metrics.record_outcome(&outcome);
                        report.record(outcome);
                    }
                }
            }
        }

        report.duration = start.elapsed();
        info!(
            processed = report.processed,
            synced = report.synced,
            no_match = report.no_match,
            failed = report.failed,
            ms = report.duration.as_millis() as u64,
            "batch sync complete"
        );
        report
    }

    /// Ids of drafts eligible for reconciliation, most recently accessed
    /// first, at most `limit`. `accessed_since` narrows to recent drafts.
    pub async fn discover_candidates(
        &self,
        limit: usize,
        accessed_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DraftId>, SyncError> {
        let mut filter = DraftFilter::sync_candidates();
        if let Some(since) = accessed_since {
            filter = filter.accessed_since(since);
        }
        let drafts = self
            .within(
                "find_many",
                self.store
                    .find_many(&filter, DraftOrder::LastAccessedDesc, limit),
            )
            .await??;
        Ok(drafts.into_iter().map(|d| d.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readzone_core::{CanonicalBook, Draft};
    use readzone_store::{MemoryCatalog, MemoryStore};

    use crate::cache::MemoryMatchCache;

    fn book(id: &str, title: &str, authors: &[&str], isbn: Option<&str>) -> CanonicalBook {
        CanonicalBook {
            id: BookId::from(id),
            isbn13: isbn.map(str::to_string),
            title: title.to_string(),
            authors: authors.iter().map(|a| a.to_string()).collect(),
            publisher: None,
        }
    }

    struct Fixture {
        store: MemoryStore,
        metrics: Arc<SyncMetrics>,
        cache: Arc<MemoryMatchCache>,
        orchestrator: Orchestrator,
    }

    fn fixture(books: Vec<CanonicalBook>) -> Fixture {
        let store = MemoryStore::new();
        let metrics = Arc::new(SyncMetrics::new());
        let cache = Arc::new(MemoryMatchCache::default());
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(MemoryCatalog::with_books(books)),
        )
        .with_cache(cache.clone())
        .with_metrics(metrics.clone())
        .with_config(OrchestratorConfig {
            chunk_delay: Duration::ZERO,
            ..OrchestratorConfig::default()
        });
        Fixture {
            store,
            metrics,
            cache,
            orchestrator,
        }
    }

    fn dune() -> BookPayload {
        BookPayload::new("Dune").with_isbn("9780441013593")
    }

    #[tokio::test]
    async fn syncs_by_isbn_and_records_metrics() {
        let f = fixture(vec![book("b1", "Dune", &["Frank Herbert"], Some("9780441013593"))]);
        f.store.insert_draft(Draft::with_payload("d1", "u1", dune())).await;

        let outcome = f.orchestrator.sync_draft_book(&DraftId::from("d1")).await;
        assert!(outcome.success());
        assert_eq!(outcome.book_id, Some(BookId::from("b1")));
        assert_eq!(outcome.match_score, Some(100));
        assert_eq!(outcome.match_type, Some(MatchType::Isbn13));

        let snap = f.metrics.snapshot();
        assert_eq!(snap.synced, 1);
        assert_eq!(snap.isbn13_matches, 1);
        assert_eq!(snap.cache_misses, 1);

        let audit = f.store.audit_log().await;
        assert_eq!(audit[0].actor_id, ActorId::from("u1"));
    }

    #[tokio::test]
    async fn missing_draft_fails_not_found() {
        let f = fixture(vec![]);
        let outcome = f.orchestrator.sync_draft_book(&DraftId::from("ghost")).await;
        assert_eq!(outcome.action, SyncAction::Failed);
        assert!(matches!(outcome.error, Some(SyncError::NotFound(_))));
        assert_eq!(f.metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn resolved_draft_short_circuits() {
        let f = fixture(vec![]);
        let mut draft = Draft::with_payload("d1", "u1", dune());
        draft.payload = None;
        draft.resolved_book_id = Some(BookId::from("b9"));
        f.store.insert_draft(draft).await;

        let outcome = f.orchestrator.sync_draft_book(&DraftId::from("d1")).await;
        assert!(outcome.success());
        assert_eq!(outcome.book_id, Some(BookId::from("b9")));
        assert!(outcome.match_type.is_none());
        assert!(f.store.audit_log().await.is_empty());
        assert!(f.cache.is_empty().await);
    }

    #[tokio::test]
    async fn draft_without_payload_is_no_match() {
        let f = fixture(vec![]);
        let mut draft = Draft::with_payload("d1", "u1", dune());
        draft.payload = None;
        f.store.insert_draft(draft).await;

        let outcome = f.orchestrator.sync_draft_book(&DraftId::from("d1")).await;
        assert_eq!(outcome.action, SyncAction::NoMatch);
        assert!(matches!(outcome.error, Some(SyncError::NoPayload(_))));
    }

    #[tokio::test]
    async fn no_candidate_is_cached_as_negative() {
        let f = fixture(vec![]);
        f.store.insert_draft(Draft::with_payload("d1", "u1", dune())).await;

        let outcome = f.orchestrator.sync_draft_book(&DraftId::from("d1")).await;
        assert_eq!(outcome.action, SyncAction::NoMatch);
        assert!(matches!(
            outcome.error,
            Some(SyncError::NoMatch { best_score: None })
        ));
        let cached = f.cache.get(&Fingerprint::of(&dune())).await.unwrap().unwrap();
        assert!(cached.book_match.is_none());
    }

    #[tokio::test]
    async fn below_threshold_cached_match_is_no_match() {
        let f = fixture(vec![book("b1", "Dune", &[], None)]);
        f.store.insert_draft(Draft::with_payload("d1", "u1", dune())).await;
        f.cache
            .set(
                &Fingerprint::of(&dune()),
                Some(BookMatch {
                    book_id: BookId::from("b1"),
                    score: 60,
                    match_type: MatchType::Fuzzy,
                }),
            )
            .await
            .unwrap();

        let outcome = f.orchestrator.sync_draft_book(&DraftId::from("d1")).await;
        assert_eq!(outcome.action, SyncAction::NoMatch);
        assert_eq!(outcome.match_score, Some(60));
        assert_eq!(f.metrics.snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn cached_match_skips_catalog() {
        // The catalog is empty, so only the cache can produce this book.
        let f = fixture(vec![]);
        f.store.insert_draft(Draft::with_payload("d1", "u1", dune())).await;
        f.cache
            .set(
                &Fingerprint::of(&dune()),
                Some(BookMatch {
                    book_id: BookId::from("cached"),
                    score: 100,
                    match_type: MatchType::Isbn13,
                }),
            )
            .await
            .unwrap();

        let outcome = f.orchestrator.sync_draft_book(&DraftId::from("d1")).await;
        assert_eq!(outcome.book_id, Some(BookId::from("cached")));
    }

    #[tokio::test]
    async fn explicit_actor_is_audited() {
        let f = fixture(vec![book("b1", "Dune", &[], Some("9780441013593"))]);
        f.store.insert_draft(Draft::with_payload("d1", "u1", dune())).await;

        let admin = ActorId::from("admin");
        let outcome = f
            .orchestrator
            .sync_draft_book_as(&DraftId::from("d1"), Some(&admin))
            .await;
        assert!(outcome.success());
        assert_eq!(f.store.audit_log().await[0].actor_id, admin);
    }

    #[tokio::test]
    async fn second_sync_is_idempotent() {
        let f = fixture(vec![book("b1", "Dune", &[], Some("9780441013593"))]);
        f.store.insert_draft(Draft::with_payload("d1", "u1", dune())).await;
        let id = DraftId::from("d1");

        assert!(f.orchestrator.sync_draft_book(&id).await.success());
        assert!(f.orchestrator.sync_draft_book(&id).await.success());
        assert_eq!(f.store.audit_log().await.len(), 1);
        assert_eq!(f.store.find_by_id(&id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn batch_counts_every_candidate() {
        let f = fixture(vec![book("b1", "Dune", &[], Some("9780441013593"))]);
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = format!("d{i}");
            f.store.insert_draft(Draft::with_payload(id.as_str(), "u1", dune())).await;
            ids.push(DraftId::from(id));
        }
        f.store
            .insert_draft(Draft::with_payload("unmatched", "u1", BookPayload::new("Nothing Like It")))
            .await;
        ids.push(DraftId::from("unmatched"));
        ids.push(DraftId::from("ghost"));

        let report = f.orchestrator.batch_sync(&ids, 2).await;
        assert_eq!(report.processed, 7);
        assert_eq!(report.synced, 5);
        assert_eq!(report.no_match, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].draft_id, DraftId::from("ghost"));
    }

    #[tokio::test]
    async fn empty_batch() {
        let f = fixture(vec![]);
        let report = f.orchestrator.batch_sync(&[], 10).await;
        assert_eq!(report.processed, 0);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn discovers_candidates_most_recent_first() {
        let f = fixture(vec![]);
        let mut old = Draft::with_payload("old", "u1", dune());
        old.last_accessed = Utc::now() - chrono::Duration::hours(3);
        f.store.insert_draft(old).await;
        f.store.insert_draft(Draft::with_payload("new", "u1", dune())).await;
        let mut resolved = Draft::with_payload("done", "u1", dune());
        resolved.payload = None;
        resolved.resolved_book_id = Some(BookId::from("b1"));
        f.store.insert_draft(resolved).await;

        let ids = f.orchestrator.discover_candidates(10, None).await.unwrap();
        assert_eq!(ids, vec![DraftId::from("new"), DraftId::from("old")]);

        let recent = f
            .orchestrator
            .discover_candidates(10, Some(Utc::now() - chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(recent, vec![DraftId::from("new")]);
    }
}
