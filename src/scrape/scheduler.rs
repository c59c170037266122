//! Scrape scheduler: ticks every enabled source on its crawl interval.
//!
//! Ticks are idempotent per `(source, tick_bucket)` so a restarted or
//! doubled scheduler never double-scrapes a window. A source whose sweeps
//! keep failing trips its health guard and stays paused until restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::adapter::SourceAdapter;
use super::ingest::ingest_records;
use crate::models::{now_ts, Source};
use crate::pipeline::AppState;
use crate::queue::Stage;

const SCHEDULER_RESOLUTION: Duration = Duration::from_secs(10);
const MAX_PAGES_PER_TICK: usize = 20;
/// Pending-parse depth above which ticks are skipped (backpressure).
const BACKPRESSURE_DEPTH: i64 = 2000;

/// Sliding-window health guard per source. Too many consecutive failures or
/// a high error rate over the window trips the guard.
struct SourceHealth {
    consecutive_failures: u32,
    window: std::collections::VecDeque<bool>,
    tripped: bool,
}

const HEALTH_WINDOW: usize = 20;
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const MAX_ERROR_RATE: f64 = 0.5;

impl SourceHealth {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            window: std::collections::VecDeque::with_capacity(HEALTH_WINDOW),
            tripped: false,
        }
    }

    fn record(&mut self, source: &str, ok: bool) {
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        if self.window.len() >= HEALTH_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(ok);

        if self.tripped {
            return;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        let error_rate = failures as f64 / self.window.len().max(1) as f64;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
            || (self.window.len() >= HEALTH_WINDOW / 2 && error_rate > MAX_ERROR_RATE)
        {
            self.tripped = true;
            error!(
                source,
                consecutive = self.consecutive_failures,
                error_rate,
                "🛑 Source paused by health guard"
            );
        }
    }

    fn is_paused(&self) -> bool {
        self.tripped
    }
}

pub struct Scheduler {
    state: AppState,
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    health: Mutex<HashMap<String, SourceHealth>>,
}

impl Scheduler {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            adapters: HashMap::new(),
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters
            .insert(adapter.source_id().to_string(), adapter);
    }

    /// Run until the shutdown flag flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(sources = self.adapters.len(), "Scrape scheduler running");
        let mut tick = tokio::time::interval(SCHEDULER_RESOLUTION);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            let sources = match self.state.store.enabled_sources() {
                Ok(sources) => sources,
                Err(e) => {
                    error!(error = %e, "Failed to load sources");
                    continue;
                }
            };
            for source in sources {
                if let Err(e) = self.maybe_tick(&source).await {
                    warn!(source = %source.id, error = %e, "Tick failed");
                }
            }
        }
    }

    async fn maybe_tick(&self, source: &Source) -> Result<()> {
        if self
            .health
            .lock()
            .get(&source.id)
            .map(|h| h.is_paused())
            .unwrap_or(false)
        {
            return Ok(());
        }
        let Some(adapter) = self.adapters.get(&source.id) else {
            debug!(source = %source.id, "No adapter registered");
            return Ok(());
        };

        // slow down when the pipeline's hot stages are behind
        for stage in [Stage::Parse, Stage::Dedupe, Stage::Price] {
            if self.state.store.queue_depth(stage)? > BACKPRESSURE_DEPTH {
                warn!(source = %source.id, stage = stage.as_str(), "Backpressure: tick skipped");
                return Ok(());
            }
        }

        let interval = source.crawl_interval_secs.max(SCHEDULER_RESOLUTION.as_secs() as i64);
        let bucket = now_ts() / interval;
        if !self.state.store.try_claim_tick(&source.id, bucket)? {
            return Ok(());
        }

        let result = self.on_tick(source, adapter.clone()).await;
        let ok = result.is_ok();
        self.health
            .lock()
            .entry(source.id.clone())
            .or_insert_with(SourceHealth::new)
            .record(&source.id, ok);
        result
    }

    /// One scrape sweep for one claimed tick.
    pub async fn on_tick(&self, source: &Source, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        let started = std::time::Instant::now();
        let mut cursor: Option<String> = None;
        let mut total_records = 0usize;
        let mut total_changed = 0usize;

        for _page in 0..MAX_PAGES_PER_TICK {
            let (records, next) = adapter.list_recent(cursor).await?;
            total_records += records.len();
            total_changed += ingest_records(&self.state, adapter.clone(), records).await?;
            cursor = next;
            if cursor.is_none() {
                break;
            }
        }

        info!(
            source = %source.id,
            records = total_records,
            changed = total_changed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scrape tick complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_trips_on_consecutive_failures() {
        let mut h = SourceHealth::new();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            h.record("s", false);
        }
        assert!(h.is_paused());
    }

    #[test]
    fn health_trips_on_error_rate() {
        let mut h = SourceHealth::new();
        // alternate but majority failures over the window
        for i in 0..HEALTH_WINDOW {
            h.record("s", i % 3 == 0);
        }
        assert!(h.is_paused());
    }

    #[test]
    fn health_stays_up_on_occasional_failure() {
        let mut h = SourceHealth::new();
        for i in 0..HEALTH_WINDOW {
            h.record("s", i % 5 != 0);
        }
        assert!(!h.is_paused());
    }
}
