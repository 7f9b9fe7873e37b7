// viewguard/src/engine/analyzer.rs
//
// Real-time analyzer — the stateful orchestrator around the scoring
// engine. Owns the per-key ingestion queues, the TTL verdict cache, and
// the scheduling loop that drains due keys through the engine and
// dispatches the resulting action.
//
// Concurrency model:
//   - DashMap for queue / cache / last-analysis state — safe across
//     tokio tasks, per-key consistency, no global lock.
//   - One scheduling loop per analyzer, interval-driven with Skip
//     semantics (a long tick skips, never queues, the next one).
//   - Loop iterations are epoch-stamped: a stale loop left over from a
//     previous start/stop cycle observes a newer epoch and exits, so
//     repeated restarts never run two loops at once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::dispatcher::{ActionSink, VerdictStore};
use crate::records::{
    AnalysisResult, AnalyzerStats, BotAnalysis, CacheEntry, EngagementKey, EngineError,
    EnforcementAction, ViewRecord,
};
use crate::scoring::ScoringEngine;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Pause between scheduled analysis batches; also the per-key
    /// rate limit for scheduled analysis.
    pub analysis_interval: std::time::Duration,
    /// Keys analyzed concurrently within one scheduled batch.
    pub batch_size: usize,
    /// Verdict cache TTL.
    pub cache_timeout_seconds: u64,
    /// When false, verdicts are computed and stored but never dispatched.
    pub enable_auto_actions: bool,
    /// Rolling retention for each key's ingestion queue.
    pub queue_retention_minutes: i64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            analysis_interval: std::time::Duration::from_secs(60),
            batch_size: 10,
            cache_timeout_seconds: 300,
            enable_auto_actions: true,
            queue_retention_minutes: 15,
        }
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────────

pub struct RealTimeAnalyzer {
    config: AnalyzerConfig,
    engine: ScoringEngine,
    sink: Arc<dyn ActionSink>,
    store: Arc<dyn VerdictStore>,

    // Per-key state, exclusively owned here
    queues: DashMap<EngagementKey, Vec<ViewRecord>>,
    cache: DashMap<EngagementKey, CacheEntry>,
    last_analysis: DashMap<EngagementKey, chrono::DateTime<Utc>>,
    // Per-key single-flight gates: concurrent analyses of the same key
    // serialize here so an escalation is never dispatched twice.
    inflight: DashMap<EngagementKey, Arc<Mutex<()>>>,

    running: AtomicBool,
    loop_epoch: AtomicU64,
}

impl RealTimeAnalyzer {
    pub fn new(
        config: AnalyzerConfig,
        engine: ScoringEngine,
        sink: Arc<dyn ActionSink>,
        store: Arc<dyn VerdictStore>,
    ) -> Self {
        Self {
            config,
            engine,
            sink,
            store,
            queues: DashMap::new(),
            cache: DashMap::new(),
            last_analysis: DashMap::new(),
            inflight: DashMap::new(),
            running: AtomicBool::new(false),
            loop_epoch: AtomicU64::new(0),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Idempotent. Launches the scheduling loop on the first call after
    /// a stop; a second call while running is a logged no-op.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("analyzer already running");
            return;
        }
        let epoch = self.loop_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(interval_ms = self.config.analysis_interval.as_millis() as u64, "analyzer started");
        tokio::spawn(self.scheduling_loop(epoch));
    }

    /// Idempotent. The loop observes the flag between iterations and
    /// exits cleanly; an in-flight analysis is never aborted.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("analyzer stopping");
        } else {
            debug!("analyzer already stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    /// Append records to their keys' queues, then prune each touched
    /// queue to the retention window. Records that fail validation are
    /// skipped and counted; the valid remainder is always enqueued — a
    /// malformed neighbor never costs a valid record its verdict.
    /// Returns (accepted, rejected).
    pub fn add_view_records(&self, records: &[ViewRecord]) -> (usize, usize) {
        let cutoff = Utc::now() - Duration::minutes(self.config.queue_retention_minutes);
        let mut accepted = 0;
        let mut rejected = 0;
        for record in records {
            if let Err(e) = record.validate() {
                rejected += 1;
                warn!("record rejected: {e}");
                continue;
            }
            let mut queue = self.queues.entry(record.key()).or_default();
            queue.push(record.clone());
            queue.retain(|r| r.timestamp >= cutoff);
            accepted += 1;
        }
        (accepted, rejected)
    }

    // ── On-demand analysis ────────────────────────────────────────────────────

    /// Serve a fresh cached verdict if one exists, otherwise score the
    /// key's current queue synchronously, cache the verdict, and
    /// dispatch its action. A cache hit never re-dispatches: the
    /// dispatch already happened when the verdict was computed.
    ///
    /// Concurrent calls for the same key serialize on the key's gate;
    /// the loser re-checks the cache and is served the winner's verdict
    /// instead of dispatching the same action a second time.
    pub async fn analyze_immediate(
        &self,
        key: &EngagementKey,
    ) -> Result<AnalysisResult, EngineError> {
        if key.promoter_id.is_empty() || key.campaign_id.is_empty() {
            return Err(EngineError::InvalidKey(key.clone()));
        }

        let started = Instant::now();
        let gate = self.gate_for(key);
        let _guard = gate.lock().await;
        let now = Utc::now();

        if let Some(entry) = self.cache.get(key) {
            if entry.is_fresh(now) {
                let analysis = entry.analysis.clone();
                drop(entry);
                return Ok(AnalysisResult {
                    analysis,
                    action_taken: false,
                    action_type: None,
                    timestamp: now,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                });
            }
            drop(entry);
            self.cache.remove(key); // lazy eviction
        }

        Ok(self.compute_and_dispatch(key, started).await)
    }

    /// The key's single-flight gate, created on first use. The map ref
    /// is released before the returned mutex is awaited.
    fn gate_for(&self, key: &EngagementKey) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Cache-bypassing compute path shared by `analyze_immediate` and
    /// the scheduling loop. Callers hold the key's gate.
    async fn compute_and_dispatch(&self, key: &EngagementKey, started: Instant) -> AnalysisResult {
        let records: Vec<ViewRecord> = self
            .queues
            .get(key)
            .map(|q| q.value().clone())
            .unwrap_or_default();

        let analysis = self.engine.analyze(key, &records);
        let now = Utc::now();

        self.cache.insert(
            key.clone(),
            CacheEntry {
                analysis: analysis.clone(),
                cached_at: now,
                ttl_seconds: self.config.cache_timeout_seconds,
            },
        );
        self.last_analysis.insert(key.clone(), now);

        if let Err(e) = self.store.store_analysis(&analysis).await {
            error!(key = %key, "verdict store failed: {e:#}");
        }

        let (action_taken, action_type) = self.take_action(&analysis).await;

        AnalysisResult {
            analysis,
            action_taken,
            action_type,
            timestamp: now,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Dispatch the verdict's action through the sink. Hook failures are
    /// caught and logged; they never abort the surrounding analysis.
    async fn take_action(&self, analysis: &BotAnalysis) -> (bool, Option<EnforcementAction>) {
        if !self.config.enable_auto_actions || analysis.action == EnforcementAction::None {
            return (false, None);
        }

        let key = analysis.key();
        let outcome = match analysis.action {
            EnforcementAction::Ban => {
                warn!(key = %key, score = analysis.bot_score, "BAN: {}", analysis.reason);
                self.sink.ban_promoter(&key, &analysis.reason).await
            }
            EnforcementAction::Warning => {
                warn!(key = %key, score = analysis.bot_score, "WARNING: {}", analysis.reason);
                self.sink.warn_promoter(&key, &analysis.reason).await
            }
            EnforcementAction::Monitor => {
                info!(key = %key, score = analysis.bot_score, "MONITOR: {}", analysis.reason);
                self.sink.monitor_promoter(&key, &analysis.reason).await
            }
            EnforcementAction::None => unreachable!(),
        };

        if let Err(e) = outcome {
            error!(key = %key, action = %analysis.action, "action hook failed: {e:#}");
        }
        (true, Some(analysis.action))
    }

    // ── Scheduled analysis ────────────────────────────────────────────────────

    async fn scheduling_loop(self: Arc<Self>, epoch: u64) {
        let mut ticker = tokio::time::interval(self.config.analysis_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst)
                || self.loop_epoch.load(Ordering::SeqCst) != epoch
            {
                debug!(epoch, "scheduling loop exiting");
                return;
            }
            Arc::clone(&self).run_scheduled_batch().await;
        }
    }

    /// One scheduled batch: housekeeping, then fan out due keys through
    /// the engine, `batch_size` in flight at once. Each key runs in its
    /// own task, so one key's failure or panic cannot cancel or delay
    /// the others in the batch.
    async fn run_scheduled_batch(self: Arc<Self>) {
        self.prune_queues();
        self.evict_stale_cache();

        let interval = Duration::milliseconds(self.config.analysis_interval.as_millis() as i64);
        let now = Utc::now();
        let due: Vec<EngagementKey> = self
            .queues
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .filter(|key| {
                self.last_analysis
                    .get(key)
                    .map(|t| now - *t >= interval)
                    .unwrap_or(true)
            })
            .collect();

        if due.is_empty() {
            return;
        }
        debug!(keys = due.len(), "scheduled analysis batch");

        for chunk in due.chunks(self.config.batch_size.max(1)) {
            let handles: Vec<_> = chunk
                .iter()
                .cloned()
                .map(|key| {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let gate = this.gate_for(&key);
                        let _guard = gate.lock().await;
                        this.compute_and_dispatch(&key, Instant::now()).await;
                    })
                })
                .collect();

            for handle in handles {
                if let Err(e) = handle.await {
                    error!("scheduled analysis task failed: {e}");
                }
            }
        }
    }

    fn prune_queues(&self) {
        let cutoff = Utc::now() - Duration::minutes(self.config.queue_retention_minutes);
        self.queues.retain(|_, queue| {
            queue.retain(|r| r.timestamp >= cutoff);
            !queue.is_empty()
        });
        // A gate with no outside holder (strong count 1: the map's own
        // Arc) has no analysis in flight and can go.
        self.inflight.retain(|_, gate| Arc::strong_count(gate) > 1);
    }

    fn evict_stale_cache(&self) {
        let now = Utc::now();
        self.cache.retain(|_, entry| entry.is_fresh(now));
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn get_statistics(&self) -> AnalyzerStats {
        AnalyzerStats {
            queued_records: self.queues.iter().map(|e| e.value().len()).sum(),
            cached_verdicts: self.cache.len(),
            is_running: self.is_running(),
            tracked_keys: self.last_analysis.len(),
        }
    }

    /// Clears queues, cache, and last-analysis state. The running flag
    /// is untouched.
    pub fn reset(&self) {
        self.queues.clear();
        self.cache.clear();
        self.last_analysis.clear();
        info!("analyzer state reset");
    }
}
