// viewguard/src/worker.rs
//
// Background worker — process-level owner of one analyzer. Pulls fresh
// samples from the injected record source on its own timer, forwards
// them to the analyzer, and exposes lifecycle, stats, and a manual
// trigger. Everything on the autonomous path is swallowed-and-logged;
// only manual triggers surface failures to the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::analyzer::RealTimeAnalyzer;
use crate::engine::dispatcher::RecordSource;
use crate::records::{AnalysisResult, EngagementKey, EngineError, ViewRecord, WorkerStats};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Pause between data-source fetch ticks. The tick cadence itself is
    /// the retry mechanism for transient fetch failures.
    pub data_fetch_interval: std::time::Duration,
    /// Bounds for `retry_operation` on discrete one-shot operations.
    pub max_retries: u32,
    pub retry_delay: std::time::Duration,
    /// Fetched records are forwarded to the analyzer in chunks this big.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_fetch_interval: std::time::Duration::from_secs(30),
            max_retries: 3,
            retry_delay: std::time::Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

pub struct BackgroundWorker {
    config: WorkerConfig,
    analyzer: Arc<RealTimeAnalyzer>,
    source: Arc<dyn RecordSource>,

    records_processed: AtomicU64,
    analyses_performed: AtomicU64,
    actions_triggered: AtomicU64,
    error_count: AtomicU64,
    last_fetch: RwLock<Option<DateTime<Utc>>>,
    last_analysis: RwLock<Option<DateTime<Utc>>>,
    started_at: RwLock<Option<DateTime<Utc>>>,

    running: AtomicBool,
    loop_epoch: AtomicU64,
}

impl BackgroundWorker {
    pub fn new(
        config: WorkerConfig,
        analyzer: Arc<RealTimeAnalyzer>,
        source: Arc<dyn RecordSource>,
    ) -> Self {
        Self {
            config,
            analyzer,
            source,
            records_processed: AtomicU64::new(0),
            analyses_performed: AtomicU64::new(0),
            actions_triggered: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_fetch: RwLock::new(None),
            last_analysis: RwLock::new(None),
            started_at: RwLock::new(None),
            running: AtomicBool::new(false),
            loop_epoch: AtomicU64::new(0),
        }
    }

    pub fn analyzer(&self) -> &Arc<RealTimeAnalyzer> {
        &self.analyzer
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// No-op if disabled or already running. Starts the analyzer, then
    /// the fetch loop.
    pub fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("worker disabled by configuration");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            info!("worker already running");
            return;
        }
        *self.started_at.write() = Some(Utc::now());
        Arc::clone(&self.analyzer).start();

        let epoch = self.loop_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            interval_ms = self.config.data_fetch_interval.as_millis() as u64,
            "worker started"
        );
        tokio::spawn(self.fetch_loop(epoch));
    }

    /// Stops the fetch loop and the analyzer. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("worker stopping");
        }
        self.analyzer.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    /// Forward records to the analyzer. Rejected records are counted as
    /// errors and dropped; the valid remainder flows through — a bad
    /// record from one producer must not take the worker down.
    pub fn add_view_records(&self, records: &[ViewRecord]) {
        if records.is_empty() {
            return;
        }
        let (accepted, rejected) = self.analyzer.add_view_records(records);
        self.records_processed.fetch_add(accepted as u64, Ordering::Relaxed);
        if rejected > 0 {
            self.error_count.fetch_add(rejected as u64, Ordering::Relaxed);
            warn!(rejected, "invalid records skipped");
        }
    }

    // ── Manual trigger ────────────────────────────────────────────────────────

    /// On-demand analysis for one key. Unlike the scheduled path, errors
    /// propagate: a human-initiated action gets an explicit failure
    /// signal.
    pub async fn trigger_analysis(
        &self,
        key: &EngagementKey,
    ) -> Result<AnalysisResult, EngineError> {
        match self.analyzer.analyze_immediate(key).await {
            Ok(result) => {
                self.analyses_performed.fetch_add(1, Ordering::Relaxed);
                if result.action_taken {
                    self.actions_triggered.fetch_add(1, Ordering::Relaxed);
                }
                *self.last_analysis.write() = Some(Utc::now());
                Ok(result)
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    // ── Fetch loop ────────────────────────────────────────────────────────────

    async fn fetch_loop(self: Arc<Self>, epoch: u64) {
        let mut ticker = tokio::time::interval(self.config.data_fetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst)
                || self.loop_epoch.load(Ordering::SeqCst) != epoch
            {
                debug!(epoch, "fetch loop exiting");
                return;
            }

            match self.source.fetch_new_records().await {
                Ok(records) => {
                    *self.last_fetch.write() = Some(Utc::now());
                    if !records.is_empty() {
                        debug!(count = records.len(), "fetched records");
                        for chunk in records.chunks(self.config.batch_size.max(1)) {
                            self.add_view_records(chunk);
                        }
                    }
                }
                // The next tick is the retry; no backoff on the loop itself.
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!("record fetch failed: {e:#}");
                }
            }
        }
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> WorkerStats {
        let uptime_seconds = self
            .started_at
            .read()
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        WorkerStats {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            analyses_performed: self.analyses_performed.load(Ordering::Relaxed),
            actions_triggered: self.actions_triggered.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_fetch: *self.last_fetch.read(),
            last_analysis: *self.last_analysis.read(),
            is_running: self.is_running(),
            uptime_seconds,
        }
    }

    /// Explicit operator reset; counters are otherwise monotonic for the
    /// life of the process.
    pub fn reset_stats(&self) {
        self.records_processed.store(0, Ordering::Relaxed);
        self.analyses_performed.store(0, Ordering::Relaxed);
        self.actions_triggered.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        *self.last_fetch.write() = None;
        *self.last_analysis.write() = None;
        info!("worker stats reset");
    }
}

// ── Retry utility ─────────────────────────────────────────────────────────────

/// Bounded retry with doubling backoff for discrete one-shot operations.
/// The scheduled fetch loop deliberately does not use this — its own
/// interval is the retry mechanism.
pub async fn retry_operation<T, E, F, Fut>(
    mut op: F,
    max_retries: u32,
    initial_delay: std::time::Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!("operation failed (attempt {attempt}/{max_retries}): {e}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
