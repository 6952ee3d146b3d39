mod display;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use readzone_core::{ActorId, DraftId};
use readzone_store::{CatalogStore, DraftStore, Seed};
use readzone_sync::{
    CacheConfig, MemoryMatchCache, MonitorReport, Orchestrator, Scheduler, SchedulerConfig,
    SyncMetrics,
};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "readzone", version)]
#[command(about = "Reconcile review drafts against the canonical book catalog")]
struct Cli {
    /// JSON file with `books` and `drafts` to load before running.
    #[arg(long, global = true, env = "READZONE_SEED")]
    seed: Option<PathBuf>,

    /// DuckDB database file. Seeded from `--seed` when both are given.
    #[cfg(feature = "duckdb")]
    #[arg(long, global = true, env = "READZONE_DB")]
    db: Option<PathBuf>,

    #[command(flatten)]
    cache: CacheArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proactive scheduler until Ctrl-C
    Run {
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Reconcile a single draft
    Sync {
        draft_id: String,
        /// Attribute the audit record to this actor instead of the draft owner.
        #[arg(long)]
        actor: Option<String>,
    },
    /// Discover candidates and reconcile them in one batch
    Batch {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 20)]
        batch_size: usize,
    },
    /// Run one reconciliation cycle now, ignoring the candidate threshold
    Trigger {
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
    /// Print component health and recommendations
    Monitor {
        #[command(flatten)]
        schedule: ScheduleArgs,
        /// Run one manual cycle before reporting.
        #[arg(long)]
        trigger: bool,
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct ScheduleArgs {
    #[arg(long, env = "PROACTIVE_SYNC_ENABLED", default_value_t = true, action = ArgAction::Set)]
    enabled: bool,
    /// Minutes between cycles.
    #[arg(long, env = "PROACTIVE_SYNC_INTERVAL", default_value_t = 30)]
    interval: u64,
    #[arg(long, env = "PROACTIVE_SYNC_BATCH_SIZE", default_value_t = 20)]
    batch_size: usize,
    #[arg(long, default_value_t = 100)]
    max_candidates: usize,
    /// Fewest candidates for a scheduled cycle to run.
    #[arg(long, default_value_t = 5)]
    threshold: usize,
    /// Seconds before the first scheduled cycle.
    #[arg(long, default_value_t = 120)]
    initial_delay: u64,
    /// Only consider drafts accessed within this many hours.
    #[arg(long)]
    recent_hours: Option<u64>,
}

impl ScheduleArgs {
    fn config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.enabled,
            sync_interval_minutes: self.interval,
            batch_size: self.batch_size,
            max_candidates: self.max_candidates,
            sync_threshold: self.threshold,
            initial_delay: Duration::from_secs(self.initial_delay),
            recent_window_hours: self.recent_hours,
        }
    }
}

#[derive(Args, Debug)]
struct CacheArgs {
    /// Match cache entry lifetime in seconds.
    #[arg(long, global = true, env = "READZONE_CACHE_TTL", default_value_t = 30 * 60)]
    cache_ttl: u64,
    #[arg(long, global = true, env = "READZONE_CACHE_CAPACITY", default_value_t = 2000)]
    cache_capacity: usize,
}

impl CacheArgs {
    fn config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache_ttl),
            capacity: self.cache_capacity,
            ..CacheConfig::default()
        }
    }
}

/// The reconciliation engine with its in-process cache and metrics.
struct Engine {
    orchestrator: Orchestrator,
    metrics: Arc<SyncMetrics>,
    cache: Arc<MemoryMatchCache>,
    _cleanup: JoinHandle<()>,
}

impl Engine {
    async fn open(cli: &Cli) -> anyhow::Result<Self> {
        let (drafts, catalog) = open_stores(cli).await?;
        let metrics = Arc::new(SyncMetrics::new());
        let cache = Arc::new(MemoryMatchCache::new(cli.cache.config()));
        let cleanup = cache.spawn_cleanup();
        let orchestrator = Orchestrator::new(drafts, catalog)
            .with_cache(cache.clone())
            .with_metrics(metrics.clone());
        Ok(Self {
            orchestrator,
            metrics,
            cache,
            _cleanup: cleanup,
        })
    }

    fn scheduler(&self, config: &SchedulerConfig) -> Scheduler {
        Scheduler::new(self.orchestrator.clone(), config.clone())
    }

    async fn report(&self, scheduler: &Scheduler) -> MonitorReport {
        MonitorReport::build(
            self.metrics.snapshot(),
            scheduler.stats().await,
            scheduler.is_healthy().await,
            Some(self.cache.health().await),
        )
    }
}

async fn open_stores(cli: &Cli) -> anyhow::Result<(Arc<dyn DraftStore>, Arc<dyn CatalogStore>)> {
    let seed = match &cli.seed {
        Some(path) => Some(
            Seed::from_path(path).with_context(|| format!("loading seed {}", path.display()))?,
        ),
        None => None,
    };

    #[cfg(feature = "duckdb")]
    if let Some(path) = &cli.db {
        let store = readzone_store::DuckStore::open_persistent(path)
            .with_context(|| format!("opening {}", path.display()))?;
        if let Some(seed) = &seed {
            store.load_seed(seed).await.context("seeding database")?;
        }
        info!(path = %path.display(), drafts = store.draft_count().await?, "opened duckdb store");
        let drafts: Arc<dyn DraftStore> = Arc::new(store.clone());
        let catalog: Arc<dyn CatalogStore> = Arc::new(store);
        return Ok((drafts, catalog));
    }

    let (drafts, catalog) = seed.unwrap_or_default().into_memory().await;
    Ok((Arc::new(drafts), Arc::new(catalog)))
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    info!("readzone v{}", env!("CARGO_PKG_VERSION"));
    let engine = Engine::open(&cli).await?;

    match cli.command {
        Command::Run { schedule } => {
            let config = schedule.config();
            let scheduler = engine.scheduler(&config);
            if scheduler.start(config).await {
                info!("scheduler running, press Ctrl-C to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("listening for Ctrl-C")?;
                scheduler.stop().await;
            }
            display::scheduler_card(&scheduler.stats().await).print();
            let cache = engine.cache.metrics().await;
            display::metrics_card(&engine.metrics.snapshot(), Some(&cache)).print();
        }
        Command::Sync { draft_id, actor } => {
            let draft_id = DraftId::from(draft_id);
            let actor = actor.map(ActorId::from);
            let outcome = engine
                .orchestrator
                .sync_draft_book_as(&draft_id, actor.as_ref())
                .await;
            display::outcome_card(&outcome).print();
        }
        Command::Batch { limit, batch_size } => {
            let candidates = engine.orchestrator.discover_candidates(limit, None).await?;
            let report = engine.orchestrator.batch_sync(&candidates, batch_size).await;
            display::batch_card(&report).print();
        }
        Command::Trigger { schedule } => {
            let scheduler = engine.scheduler(&schedule.config());
            let result = scheduler.trigger_manual_sync().await;
            display::manual_card(&result).print();
            display::scheduler_card(&scheduler.stats().await).print();
        }
        Command::Monitor {
            schedule,
            trigger,
            json,
        } => {
            let config = schedule.config();
            let scheduler = engine.scheduler(&config);
            scheduler.start(config).await;
            if trigger {
                let result = scheduler.trigger_manual_sync().await;
                if !json {
                    display::manual_card(&result).print();
                }
            }
            let report = engine.report(&scheduler).await;
            scheduler.stop().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                display::report_card(&report).print();
                display::metrics_card(&report.metrics, None).print();
                display::scheduler_card(&report.scheduler_stats).print();
            }
        }
    }
    Ok(())
}
