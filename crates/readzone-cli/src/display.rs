//! Vertical card display for reconciliation results and operator reports.
//!
//! Every card is a title line followed by named sections of aligned
//! key/value rows. Sections with no rows are left out.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use readzone_sync::cache::CacheMetrics;
use readzone_sync::{
    BatchReport, ManualSyncResult, MetricsSnapshot, MonitorReport, SchedulerSnapshot, SyncOutcome,
};

const MAX_LIST_ITEMS: usize = 10;

struct Section {
    header: &'static str,
    rows: Vec<(String, String)>,
}

/// A titled group of sections, rendered on demand.
pub struct Card {
    title: String,
    subtitle: Option<String>,
    sections: Vec<Section>,
}

impl Card {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subtitle: None,
            sections: Vec::new(),
        }
    }

    fn subtitle(mut self, text: impl Into<String>) -> Self {
        self.subtitle = Some(text.into());
        self
    }

    fn section(mut self, header: &'static str) -> Self {
        self.sections.push(Section {
            header,
            rows: Vec::new(),
        });
        self
    }

    fn row(mut self, key: &str, value: impl Display) -> Self {
        if let Some(section) = self.sections.last_mut() {
            section.rows.push((key.to_string(), value.to_string()));
        }
        self
    }

    /// Row only when `value` is present.
    fn opt(self, key: &str, value: Option<impl Display>) -> Self {
        match value {
            Some(v) => self.row(key, v),
            None => self,
        }
    }

    pub fn print(&self) {
        print!("{self}");
    }
}

impl Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.title)?;
        if let Some(subtitle) = &self.subtitle {
            writeln!(f, "{subtitle}")?;
        }
        writeln!(f)?;
        for section in self.sections.iter().filter(|s| !s.rows.is_empty()) {
            writeln!(f, "{}", section.header)?;
            for (key, value) in &section.rows {
                writeln!(f, "  {:<26} {}", key, value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

// ── Cards ──

pub fn outcome_card(outcome: &SyncOutcome) -> Card {
    Card::new(format!("draft {}", outcome.draft_id))
        .subtitle(outcome.action.as_str())
        .section("Result")
        .opt("book_id", outcome.book_id.as_ref())
        .opt("match_score", outcome.match_score)
        .opt("match_type", outcome.match_type.map(|t| t.as_str()))
        .row("duration_ms", outcome.duration.as_millis())
        .section("Error")
        .opt("kind", outcome.error.as_ref().map(|e| e.kind()))
        .opt("message", outcome.error.as_ref())
}

pub fn manual_card(result: &ManualSyncResult) -> Card {
    Card::new("manual sync")
        .subtitle(if result.success { "completed" } else { "not run" })
        .section("Result")
        .row("processed", result.processed)
        .row("synced", result.synced)
        .row("duration_ms", result.duration.as_millis())
        .opt("error", result.error.as_deref())
}

pub fn batch_card(report: &BatchReport) -> Card {
    let mut card = Card::new("batch sync")
        .section("Counts")
        .row("processed", report.processed)
        .row("synced", report.synced)
        .row("no_match", report.no_match)
        .row("failed", report.failed)
        .row("duration_ms", report.duration.as_millis())
        .section("Errors");
    for e in report.errors.iter().take(MAX_LIST_ITEMS) {
        card = card.row(e.draft_id.as_str(), &e.message);
    }
    if report.errors.len() > MAX_LIST_ITEMS {
        card = card.row("...", format!("{} more", report.errors.len() - MAX_LIST_ITEMS));
    }
    card
}

pub fn scheduler_card(snapshot: &SchedulerSnapshot) -> Card {
    let config = &snapshot.config;
    let stats = &snapshot.stats;
    Card::new("proactive sync scheduler")
        .subtitle(if snapshot.active { "running" } else { "stopped" })
        .section("Configuration")
        .row("enabled", yes_no(config.enabled))
        .row("interval_minutes", config.sync_interval_minutes)
        .row("batch_size", config.batch_size)
        .row("max_candidates", config.max_candidates)
        .row("sync_threshold", config.sync_threshold)
        .row("initial_delay_secs", config.initial_delay.as_secs())
        .opt("recent_window_hours", config.recent_window_hours)
        .section("Runs")
        .row("cycle_in_progress", yes_no(snapshot.cycle_in_progress))
        .row("total_runs", stats.total_runs)
        .row("successful_runs", stats.successful_runs)
        .row("skipped_runs", stats.skipped_runs)
        .row("average_processing_ms", format!("{:.1}", stats.average_processing_ms))
        .row("candidates_processed", stats.candidates_processed)
        .row("candidates_synced", stats.candidates_synced)
        .section("Timestamps")
        .opt("last_run", stats.last_run.map(timestamp))
        .opt("next_run", stats.next_run.map(timestamp))
}

pub fn metrics_card(metrics: &MetricsSnapshot, cache: Option<&CacheMetrics>) -> Card {
    let mut card = Card::new("sync metrics")
        .section("Outcomes")
        .row("total", metrics.total)
        .row("synced", metrics.synced)
        .row("no_match", metrics.no_match)
        .row("failed", metrics.failed)
        .opt("success_rate", metrics.success_rate().map(percent))
        .row("average_duration_ms", format!("{:.1}", metrics.average_duration_ms))
        .opt("last_synced_at", metrics.last_synced_at.map(timestamp))
        .section("Match Types")
        .row("isbn13", metrics.isbn13_matches)
        .row("title_author", metrics.title_author_matches)
        .row("fuzzy", metrics.fuzzy_matches)
        .section("Cache")
        .opt("lookup_hit_rate", metrics.cache_hit_rate().map(percent));
    if let Some(cache) = cache {
        card = card
            .row("size", format!("{} / {}", cache.size, cache.capacity))
            .row("hits", cache.hits)
            .row("misses", cache.misses)
            .row("evictions", cache.evictions);
    }
    card
}

pub fn report_card(report: &MonitorReport) -> Card {
    let mut card = Card::new("reconciliation health")
        .subtitle(report.overall.as_str())
        .section("Components")
        .row("sync_service", report.sync_service.as_str())
        .row("scheduler", report.scheduler.as_str())
        .opt("cache", report.cache.map(|c| c.as_str()))
        .row("generated_at", timestamp(report.generated_at))
        .section("Recommendations");
    for (i, rec) in report.recommendations.iter().enumerate() {
        let key = format!("{}. {:?}/{:?}", i + 1, rec.priority, rec.kind).to_lowercase();
        card = card.row(&key, &rec.message);
    }
    card
}
