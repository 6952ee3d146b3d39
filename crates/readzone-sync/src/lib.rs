//! Book reconciliation engine: resolves raw book metadata on drafts into
//! canonical catalog references.
//!
//! Leaves first: [`matcher`] scores catalog candidates, [`cache`] memoizes
//! match results, [`transaction`] binds a draft under a version predicate,
//! [`orchestrator`] composes them per draft and per batch, and [`scheduler`]
//! drives periodic reconciliation cycles. [`monitor`] folds [`metrics`] and
//! scheduler state into an operator health report.

mod duration;
mod error;
pub use error::SyncError;

pub mod cache;
pub mod matcher;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
pub mod transaction;

pub use cache::{CacheConfig, CacheError, CacheHealth, CacheMetrics, MatchCache, MemoryMatchCache};
pub use matcher::{MATCH_THRESHOLD, Matcher};
pub use metrics::{MetricsSink, MetricsSnapshot, SyncMetrics};
pub use monitor::{HealthStatus, MonitorReport, Priority, Recommendation, RecommendationKind};
pub use orchestrator::{BatchReport, Orchestrator, OrchestratorConfig, SyncOutcome};
pub use scheduler::{
    ConfigUpdate, ManualSyncResult, Scheduler, SchedulerConfig, SchedulerSnapshot, SchedulerStats,
};
pub use transaction::perform_sync;
