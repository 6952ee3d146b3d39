//! Outcome counters for reconciliation attempts.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use readzone_core::{MatchType, SyncAction};
use serde::Serialize;

use crate::orchestrator::SyncOutcome;

/// Receives one record per reconciliation attempt and per cache lookup.
pub trait MetricsSink: Send + Sync {
    fn record_outcome(&self, outcome: &SyncOutcome);

    fn record_cache_lookup(&self, hit: bool);
}

const NEVER: i64 = i64::MIN;

/// Lock-free in-process [`MetricsSink`].
#[derive(Debug)]
pub struct SyncMetrics {
    synced: AtomicU64,
    no_match: AtomicU64,
    failed: AtomicU64,
    isbn13: AtomicU64,
    title_author: AtomicU64,
    fuzzy: AtomicU64,
    total_duration_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    last_synced_ms: AtomicI64,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            synced: AtomicU64::new(0),
            no_match: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            isbn13: AtomicU64::new(0),
            title_author: AtomicU64::new(0),
            fuzzy: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            last_synced_ms: AtomicI64::new(NEVER),
        }
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let synced = self.synced.load(Ordering::Relaxed);
        let no_match = self.no_match.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = synced + no_match + failed;
        let total_ms = self.total_duration_ms.load(Ordering::Relaxed);
        let last = self.last_synced_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            synced,
            no_match,
            failed,
            total,
            isbn13_matches: self.isbn13.load(Ordering::Relaxed),
            title_author_matches: self.title_author.load(Ordering::Relaxed),
            fuzzy_matches: self.fuzzy.load(Ordering::Relaxed),
            average_duration_ms: if total > 0 {
                total_ms as f64 / total as f64
            } else {
                0.0
            },
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            last_synced_at: if last == NEVER {
                None
            } else {
                DateTime::<Utc>::from_timestamp_millis(last)
            },
        }
    }
}

impl MetricsSink for SyncMetrics {
    fn record_outcome(&self, outcome: &SyncOutcome) {
        let counter = match outcome.action {
            SyncAction::Synced => &self.synced,
            SyncAction::NoMatch => &self.no_match,
            SyncAction::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if outcome.action == SyncAction::Synced
            && let Some(match_type) = outcome.match_type
        {
            let counter = match match_type {
                MatchType::Isbn13 => &self.isbn13,
                MatchType::TitleAuthor => &self.title_author,
                MatchType::Fuzzy => &self.fuzzy,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            self.last_synced_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }

        let ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn record_cache_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub synced: u64,
    pub no_match: u64,
    pub failed: u64,
    pub total: u64,
    pub isbn13_matches: u64,
    pub title_author_matches: u64,
    pub fuzzy_matches: u64,
    pub average_duration_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Last time a draft was bound to a book by this process.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    /// synced / (synced + failed). `None` before any such attempt.
    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.synced + self.failed;
        (attempts > 0).then(|| self.synced as f64 / attempts as f64)
    }

    /// Share of cache lookups that hit. `None` before any lookup.
    pub fn cache_hit_rate(&self) -> Option<f64> {
        let lookups = self.cache_hits + self.cache_misses;
        (lookups > 0).then(|| self.cache_hits as f64 / lookups as f64)
    }
}
