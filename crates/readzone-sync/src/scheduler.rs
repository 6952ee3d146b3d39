//! Proactive reconciliation scheduler.
//!
//! A single timer task drives reconciliation cycles: discover candidates,
//! skip when there are fewer than `sync_threshold`, otherwise batch-sync them
//! and fold the report into [`SchedulerStats`]. One atomic flag guards the
//! cycle body and is shared with [`Scheduler::trigger_manual_sync`], so at
//! most one cycle runs at any instant; the loser of the race returns
//! immediately instead of queuing.
//!
//! Each cycle runs on its own task, so a panic inside one is logged and
//! counted as a failed run while the timer keeps ticking.
//!
//! [`Scheduler::stop`] only signals the timer task. A cycle already in
//! progress runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::orchestrator::{BatchReport, Orchestrator};
use crate::SyncError;

/// Liveness tolerance: a cycle must have happened within this many intervals.
const LIVENESS_FACTOR: f64 = 1.5;
/// Longest accepted interval between cycles: one year.
const MAX_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub sync_interval_minutes: u64,
    pub batch_size: usize,
    pub max_candidates: usize,
    /// Minimum candidates for a scheduled cycle to do any work.
    pub sync_threshold: usize,
    /// Delay before the first cycle after start.
    #[serde(with = "crate::duration::secs")]
    pub initial_delay: Duration,
    /// Only consider drafts accessed within this many hours.
    pub recent_window_hours: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_minutes: 30,
            batch_size: 20,
            max_candidates: 100,
            sync_threshold: 5,
            initial_delay: Duration::from_secs(2 * 60),
            recent_window_hours: None,
        }
    }
}

impl SchedulerConfig {
    /// Time between cycles, clamped to between one minute and one year.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.clamp(1, MAX_INTERVAL_MINUTES) * 60)
    }

    /// Lower bound on `last_accessed` for candidates, if a window is set and
    /// representable.
    fn accessed_since(&self) -> Option<DateTime<Utc>> {
        let hours = i64::try_from(self.recent_window_hours?).ok()?;
        Utc::now().checked_sub_signed(chrono::Duration::try_hours(hours)?)
    }

    fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(v) = update.enabled {
            self.enabled = v;
        }
        if let Some(v) = update.sync_interval_minutes {
            self.sync_interval_minutes = v;
        }
        if let Some(v) = update.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = update.max_candidates {
            self.max_candidates = v;
        }
        if let Some(v) = update.sync_threshold {
            self.sync_threshold = v;
        }
        if let Some(v) = update.recent_window_hours {
            self.recent_window_hours = v;
        }
    }
}

/// Partial [`SchedulerConfig`] for [`Scheduler::update_config`]. Unset
/// fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub sync_interval_minutes: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_candidates: Option<usize>,
    pub sync_threshold: Option<usize>,
    pub recent_window_hours: Option<Option<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// End of the last cycle that ran a batch (or failed trying).
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub successful_runs: u64,
    /// Cycles skipped for having fewer candidates than the threshold.
    pub skipped_runs: u64,
    /// Moving average over every run counted in `total_runs`.
    pub average_processing_ms: f64,
    pub candidates_processed: u64,
    pub candidates_synced: u64,
}

impl SchedulerStats {
    fn record_run(&mut self, duration: Duration, processed: usize, synced: usize, successful: bool) {
        self.last_run = Some(Utc::now());
        self.total_runs += 1;
        if successful {
            self.successful_runs += 1;
        }
        let ms = duration.as_secs_f64() * 1000.0;
        let n = self.total_runs as f64;
        self.average_processing_ms = (self.average_processing_ms * (n - 1.0) + ms) / n;
        self.candidates_processed += processed as u64;
        self.candidates_synced += synced as u64;
    }
}

/// Stats plus the configuration they were produced under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    /// The timer task is live.
    pub active: bool,
    pub cycle_in_progress: bool,
    pub config: SchedulerConfig,
    pub stats: SchedulerStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualSyncResult {
    pub success: bool,
    pub processed: usize,
    pub synced: usize,
    #[serde(with = "crate::duration::millis")]
    pub duration: Duration,
    pub error: Option<String>,
}

/// How a cycle ended.
#[derive(Debug)]
enum CycleOutcome {
    /// Another cycle held the guard.
    AlreadyRunning,
    /// Fewer candidates than the threshold.
    Skipped,
    Completed(BatchReport),
    Failed(SyncError),
}

struct Timer {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Timer {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

struct State {
    config: SchedulerConfig,
    stats: SchedulerStats,
    timer: Option<Timer>,
    /// Monotonic time of the last cycle that ran or was skipped.
    last_activity: Option<Instant>,
}

impl State {
    fn timer_live(&self) -> bool {
        self.timer.as_ref().is_some_and(Timer::is_live)
    }
}

struct Shared {
    orchestrator: Orchestrator,
    state: Mutex<State>,
    cycle_running: AtomicBool,
}

/// Releases the cycle flag, including when the cycle unwinds.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic driver for [`Orchestrator::batch_sync`]. Clones share one scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// A stopped scheduler holding `config`.
    pub fn new(orchestrator: Orchestrator, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                orchestrator,
                state: Mutex::new(State {
                    config,
                    stats: SchedulerStats::default(),
                    timer: None,
                    last_activity: None,
                }),
                cycle_running: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the configuration and start the timer. Returns `false` when
    /// the scheduler is disabled or already running.
    pub async fn start(&self, config: SchedulerConfig) -> bool {
        let mut state = self.shared.state.lock().await;
        state.config = config;
        self.start_locked(&mut state)
    }

    fn start_locked(&self, state: &mut State) -> bool {
        if !state.config.enabled {
            info!("proactive sync scheduler is disabled");
            return false;
        }
        if state.timer_live() {
            info!("proactive sync scheduler already running");
            return false;
        }

        let period = state.config.interval();
        let initial_delay = state.config.initial_delay;
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(run_timer(
            Arc::downgrade(&self.shared),
            Arc::clone(&stop),
            initial_delay,
            period,
        ));
        state.timer = Some(Timer { stop, task });
        state.stats.next_run = wall_after(initial_delay.min(period));
        info!(
            interval_minutes = state.config.sync_interval_minutes,
            initial_delay_secs = initial_delay.as_secs(),
            "proactive sync scheduler started"
        );
        true
    }

    /// Stop the timer. A cycle in progress is not interrupted.
    pub async fn stop(&self) {
        let mut state = self.shared.state.lock().await;
        Self::stop_locked(&mut state);
    }

    fn stop_locked(state: &mut State) {
        if let Some(timer) = state.timer.take() {
            timer.stop.notify_one();
            state.stats.next_run = None;
            info!("proactive sync scheduler stopped");
        }
    }

    /// Merge `update` into the configuration. An interval change restarts a
    /// running timer; disabling stops it.
    pub async fn update_config(&self, update: ConfigUpdate) {
        let mut state = self.shared.state.lock().await;
        let old_interval = state.config.sync_interval_minutes;
        state.config.apply(&update);

        if state.timer.is_some() {
            if !state.config.enabled {
                Self::stop_locked(&mut state);
            } else if state.config.sync_interval_minutes != old_interval {
                Self::stop_locked(&mut state);
                self.start_locked(&mut state);
            }
        }
        info!(config = ?state.config, "proactive sync config updated");
    }

    /// Run one cycle now, regardless of the candidate threshold. Returns
    /// immediately with an error when a cycle is already in progress.
    pub async fn trigger_manual_sync(&self) -> ManualSyncResult {
        let start = Instant::now();
        match self.shared.run_cycle_isolated(true).await {
            CycleOutcome::Completed(report) => ManualSyncResult {
                success: true,
                processed: report.processed,
                synced: report.synced,
                duration: start.elapsed(),
                error: None,
            },
            CycleOutcome::AlreadyRunning => ManualSyncResult {
                success: false,
                processed: 0,
                synced: 0,
                duration: Duration::ZERO,
                error: Some("sync already running".to_string()),
            },
            CycleOutcome::Failed(e) => ManualSyncResult {
                success: false,
                processed: 0,
                synced: 0,
                duration: start.elapsed(),
                error: Some(e.to_string()),
            },
            CycleOutcome::Skipped => ManualSyncResult {
                success: true,
                processed: 0,
                synced: 0,
                duration: start.elapsed(),
                error: None,
            },
        }
    }

    pub async fn stats(&self) -> SchedulerSnapshot {
        let state = self.shared.state.lock().await;
        SchedulerSnapshot {
            active: state.timer_live(),
            cycle_in_progress: self.shared.cycle_running.load(Ordering::Acquire),
            config: state.config.clone(),
            stats: state.stats.clone(),
        }
    }

    /// Liveness only. Healthy when disabled on purpose, or when running and
    /// the last cycle is no older than 1.5 intervals. Never restarts anything.
    pub async fn is_healthy(&self) -> bool {
        let state = self.shared.state.lock().await;
        if !state.config.enabled {
            return true;
        }
        if !state.timer_live() {
            return false;
        }
        match state.last_activity {
            Some(at) => at.elapsed() <= state.config.interval().mul_f64(LIVENESS_FACTOR),
            None => true,
        }
    }
}

impl Shared {
    /// Run a cycle on its own task. A panic inside the cycle is logged and
    /// recorded as a failed run instead of unwinding into the caller.
    async fn run_cycle_isolated(self: &Arc<Self>, manual: bool) -> CycleOutcome {
        let start = Instant::now();
        let shared = Arc::clone(self);
        match tokio::spawn(async move { shared.run_cycle(manual).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(manual, error = %e, "sync cycle panicked");
                self.finish(|stats| stats.record_run(start.elapsed(), 0, 0, false))
                    .await;
                CycleOutcome::Failed(SyncError::Panicked(e.to_string()))
            }
        }
    }

    async fn run_cycle(&self, manual: bool) -> CycleOutcome {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(manual, "skipping sync cycle, another is in progress");
            return CycleOutcome::AlreadyRunning;
        }
        let _guard = CycleGuard(&self.cycle_running);

        let config = self.state.lock().await.config.clone();
        let start = Instant::now();
        let since = config.accessed_since();

        match self
            .orchestrator
            .discover_candidates(config.max_candidates, since)
            .await
        {
            Err(e) => {
                error!(error = %e, "candidate discovery failed");
                self.finish(|stats| stats.record_run(start.elapsed(), 0, 0, false))
                    .await;
                CycleOutcome::Failed(e)
            }
            Ok(ids) if !manual && ids.len() < config.sync_threshold => {
                info!(
                    candidates = ids.len(),
                    threshold = config.sync_threshold,
                    "not enough candidates, skipping sync cycle"
                );
                self.finish(|stats| stats.skipped_runs += 1).await;
                CycleOutcome::Skipped
            }
            Ok(ids) => {
                info!(candidates = ids.len(), manual, "sync cycle starting");
                let report = self.orchestrator.batch_sync(&ids, config.batch_size).await;
                for e in report.errors.iter().take(5) {
                    warn!(draft_id = %e.draft_id, error = %e.message, "candidate failed");
                }
                self.finish(|stats| {
                    stats.record_run(start.elapsed(), report.processed, report.synced, true)
                })
                .await;
                CycleOutcome::Completed(report)
            }
        }
    }

    /// Fold a cycle into the stats and advance `next_run`.
    async fn finish(&self, update: impl FnOnce(&mut SchedulerStats)) {
        let mut state = self.state.lock().await;
        update(&mut state.stats);
        state.last_activity = Some(Instant::now());
        if state.timer.is_some() {
            state.stats.next_run = wall_after(state.config.interval());
        }
    }
}

async fn run_timer(shared: Weak<Shared>, stop: Arc<Notify>, initial_delay: Duration, period: Duration) {
    let initial = tokio::time::sleep(initial_delay);
    tokio::pin!(initial);
    let mut initial_pending = true;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => break,
            _ = &mut initial, if initial_pending => initial_pending = false,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.run_cycle_isolated(false).await;
    }
}

/// Wall-clock time `d` from now, if representable.
fn wall_after(d: Duration) -> Option<DateTime<Utc>> {
    let d = chrono::Duration::from_std(d).ok()?;
    Utc::now().checked_add_signed(d)
}
