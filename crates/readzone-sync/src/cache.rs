//! Memoization of matcher results keyed by payload fingerprint.
//!
//! The cache is best-effort: callers treat any [`CacheError`] as a miss and
//! fall back to the matcher. Negative results are cached too, so a book added
//! to the catalog may go unseen for one TTL.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use readzone_core::{BookMatch, Fingerprint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Share of capacity dropped when an insert finds the cache full.
const EVICTION_FRACTION: f64 = 0.2;
/// Hit rate (percent) below which the cache reports itself unhealthy.
const MIN_HEALTHY_HIT_RATE: f64 = 70.0;
/// Lookups needed before the hit rate is judged.
const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 20;
const NEAR_CAPACITY: f64 = 0.9;
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on TTL and cleanup interval: one year.
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("match cache unavailable: {0}")]
    Unavailable(String),
}

/// A memoized matcher result. `book_match` is `None` for a cached negative.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMatch {
    pub book_match: Option<BookMatch>,
    pub written_at: DateTime<Utc>,
}

#[async_trait]
pub trait MatchCache: Send + Sync {
    /// `Ok(None)` is a miss; an expired entry is a miss.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CachedMatch>, CacheError>;

    /// Store (or overwrite) the matcher result for `fingerprint`.
    async fn set(
        &self,
        fingerprint: &Fingerprint,
        book_match: Option<BookMatch>,
    ) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "crate::duration::secs")]
    pub ttl: Duration,
    pub capacity: usize,
    #[serde(with = "crate::duration::secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            capacity: 2000,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Percentage, 0 to 100.
    pub hit_rate: f64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

struct Entry {
    value: CachedMatch,
    expires_at: Instant,
    /// Logical clock of the last read or write, for LRU ordering.
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Fingerprint, Entry>,
    clock: u64,
    requests: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self, count: usize) -> usize {
        let mut by_age: Vec<(u64, Fingerprint)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.last_used, k.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(used, _)| *used);
        let mut removed = 0;
        for (_, key) in by_age.into_iter().take(count) {
            self.entries.remove(&key);
            removed += 1;
        }
        self.evictions += removed as u64;
        removed
    }
}

/// In-process TTL cache with least-recently-used eviction.
pub struct MemoryMatchCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl MemoryMatchCache {
    /// `ttl` is capped at one year; `cleanup_interval` is kept between one
    /// second and one year.
    pub fn new(mut config: CacheConfig) -> Self {
        config.ttl = config.ttl.min(MAX_DURATION);
        config.cleanup_interval = config
            .cleanup_interval
            .clamp(MIN_CLEANUP_INTERVAL, MAX_DURATION);
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "purged expired match cache entries");
        }
        removed
    }

    /// Spawn the periodic expiry sweep. The task ends once the cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.purge_expired().await;
            }
        })
    }

    pub async fn metrics(&self) -> CacheMetrics {
        let inner = self.inner.lock().await;
        let hit_rate = if inner.requests > 0 {
            inner.hits as f64 / inner.requests as f64 * 100.0
        } else {
            0.0
        };
        CacheMetrics {
            requests: inner.requests,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
            evictions: inner.evictions,
            size: inner.entries.len(),
            capacity: self.config.capacity,
        }
    }

    pub async fn health(&self) -> CacheHealth {
        let m = self.metrics().await;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if m.requests >= MIN_LOOKUPS_FOR_HIT_RATE && m.hit_rate < MIN_HEALTHY_HIT_RATE {
            issues.push(format!("low cache hit rate: {:.1}%", m.hit_rate));
            recommendations.push("increase the cache TTL or review the fingerprint strategy".into());
        }
        if m.size as f64 > m.capacity as f64 * NEAR_CAPACITY {
            issues.push(format!("cache near capacity: {}/{}", m.size, m.capacity));
            recommendations.push("increase cache capacity or decrease the TTL".into());
        }

        CacheHealth {
            healthy: issues.is_empty(),
            issues,
            recommendations,
        }
    }

    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
        info!("match cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryMatchCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[async_trait]
impl MatchCache for MemoryMatchCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CachedMatch>, CacheError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.requests += 1;
        let used = inner.tick();

        let expired = match inner.entries.get_mut(fingerprint) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = used;
                let value = entry.value.clone();
                inner.hits += 1;
                debug!(%fingerprint, "match cache hit");
                return Ok(Some(value));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(fingerprint);
        }
        inner.misses += 1;
        Ok(None)
    }

    async fn set(
        &self,
        fingerprint: &Fingerprint,
        book_match: Option<BookMatch>,
    ) -> Result<(), CacheError> {
        let capacity = self.config.capacity;
        if capacity == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(fingerprint) && inner.entries.len() >= capacity {
            let count = ((capacity as f64 * EVICTION_FRACTION) as usize).max(1);
            let removed = inner.evict_lru(count);
            debug!(removed, capacity, "evicted least recently used match cache entries");
        }
        let used = inner.tick();
        inner.entries.insert(
            fingerprint.clone(),
            Entry {
                value: CachedMatch {
                    book_match,
                    written_at: Utc::now(),
                },
                expires_at: Instant::now() + self.config.ttl,
                last_used: used,
            },
        );
        Ok(())
    }
}
