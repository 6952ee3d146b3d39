//! Operator health report over the sync metrics, scheduler, and cache.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheHealth;
use crate::metrics::MetricsSnapshot;
use crate::scheduler::SchedulerSnapshot;

const HEALTHY_SUCCESS_RATE: f64 = 0.95;
const WARNING_SUCCESS_RATE: f64 = 0.8;
/// Below this share of processed candidates ending up synced, matching needs a look.
const LOW_MATCH_YIELD: f64 = 0.3;

/// Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    fn from_success_rate(rate: Option<f64>) -> Self {
        match rate {
            None => Self::Healthy,
            Some(r) if r >= HEALTHY_SUCCESS_RATE => Self::Healthy,
            Some(r) if r >= WARNING_SUCCESS_RATE => Self::Warning,
            Some(_) => Self::Critical,
        }
    }
}

/// Ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Performance,
    Configuration,
    Optimization,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Priority,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    pub overall: HealthStatus,
    pub sync_service: HealthStatus,
    pub scheduler: HealthStatus,
    /// `None` when the engine runs without a cache.
    pub cache: Option<HealthStatus>,
    pub metrics: MetricsSnapshot,
    pub scheduler_stats: SchedulerSnapshot,
    pub cache_health: Option<CacheHealth>,
    /// Most urgent first.
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl MonitorReport {
    pub fn build(
        metrics: MetricsSnapshot,
        scheduler_stats: SchedulerSnapshot,
        scheduler_healthy: bool,
        cache_health: Option<CacheHealth>,
    ) -> Self {
        let success_rate = metrics.success_rate();
        let sync_service = HealthStatus::from_success_rate(success_rate);
        let scheduler = if scheduler_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Critical
        };
        let cache = cache_health.as_ref().map(|h| {
            if h.healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Warning
            }
        });
        let overall = [Some(sync_service), Some(scheduler), cache]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(HealthStatus::Healthy);

        let mut recommendations = Vec::new();
        if let Some(rate) = success_rate
            && rate < HEALTHY_SUCCESS_RATE
        {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Performance,
                priority: Priority::High,
                message: format!(
                    "sync success rate is low ({:.1}%); check store availability and conflict volume",
                    rate * 100.0
                ),
            });
        }
        if !scheduler_stats.config.enabled {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Configuration,
                priority: Priority::Medium,
                message: "proactive sync is disabled; enable it so drafts resolve before users reopen them"
                    .to_string(),
            });
        }
        let stats = &scheduler_stats.stats;
        if stats.candidates_processed > 0
            && (stats.candidates_synced as f64 / stats.candidates_processed as f64) < LOW_MATCH_YIELD
        {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Optimization,
                priority: Priority::Low,
                message: format!(
                    "low match yield ({} of {} candidates synced); review matching rules",
                    stats.candidates_synced, stats.candidates_processed
                ),
            });
        }
        if let Some(health) = &cache_health {
            for (issue, advice) in health.issues.iter().zip(&health.recommendations) {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::Cache,
                    priority: Priority::Medium,
                    message: format!("{issue}: {advice}"),
                });
            }
        }
        recommendations.sort_by_key(|r| r.priority);

        Self {
            overall,
            sync_service,
            scheduler,
            cache,
            metrics,
            scheduler_stats,
            cache_health,
            recommendations,
            generated_at: Utc::now(),
        }
    }
}
