// viewguard/src/engine/dispatcher.rs
//
// Hook seams between the engine and the surrounding product, plus the
// default JSONL file implementations. The analyzer treats every hook as
// a best-effort side effect: failures are caught and logged, never
// propagated past the enclosing analysis.
// Wire these files to your enforcement API / payout system in production.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::records::{BotAnalysis, EngagementKey, EnforcementAction, ViewRecord};

// ── Hook traits ───────────────────────────────────────────────────────────────

/// Outbound enforcement collaborator — one method per escalation tier.
/// The implementations perform the actual account/payout mutation.
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Suspend the promoter's account and cancel the pending payout.
    async fn ban_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()>;
    /// Hold the payout for manual review.
    async fn warn_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()>;
    /// Add the promoter to the watchlist.
    async fn monitor_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()>;
}

/// Durable storage for computed verdicts — called once per non-cache-hit
/// verdict.
#[async_trait]
pub trait VerdictStore: Send + Sync {
    async fn store_analysis(&self, analysis: &BotAnalysis) -> Result<()>;
}

/// Where fresh engagement samples come from. The worker does not know or
/// care whether this is a platform poller, a database tailer, or a file.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Return all records observed since the previous call.
    async fn fetch_new_records(&self) -> Result<Vec<ViewRecord>>;
}

// ── JSONL implementations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLine {
    pub action: EnforcementAction,
    pub promoter_id: String,
    pub campaign_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Appends every dispatched action to per-tier JSONL files plus a
/// combined audit log.
pub struct JsonlActionSink {
    out: PathBuf,
}

impl JsonlActionSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)?;
        Ok(Self { out })
    }

    // flush before returning: tokio's File completes buffered writes in a
    // background task on drop and swallows their errors, so without it a
    // line may not be visible (or may be lost) when the call returns.
    async fn append(&self, file: &str, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.out.join(file))
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }

    async fn record(&self, action: EnforcementAction, key: &EngagementKey, reason: &str) -> Result<()> {
        let line = serde_json::to_string(&ActionLine {
            action,
            promoter_id: key.promoter_id.clone(),
            campaign_id: key.campaign_id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })? + "\n";

        let file = match action {
            EnforcementAction::Ban => "enforcement_actions.jsonl",
            EnforcementAction::Warning => "payout_holds.jsonl",
            EnforcementAction::Monitor => "watchlist.jsonl",
            EnforcementAction::None => return Ok(()),
        };
        self.append(file, &line).await?;
        self.append("audit_log.jsonl", &line).await
    }
}

#[async_trait]
impl ActionSink for JsonlActionSink {
    async fn ban_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()> {
        self.record(EnforcementAction::Ban, key, reason).await
    }

    async fn warn_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()> {
        self.record(EnforcementAction::Warning, key, reason).await
    }

    async fn monitor_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()> {
        self.record(EnforcementAction::Monitor, key, reason).await
    }
}

/// Appends each computed verdict to verdicts.jsonl.
pub struct JsonlVerdictStore {
    out: PathBuf,
}

impl JsonlVerdictStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)?;
        Ok(Self { out })
    }
}

#[async_trait]
impl VerdictStore for JsonlVerdictStore {
    async fn store_analysis(&self, analysis: &BotAnalysis) -> Result<()> {
        let line = serde_json::to_string(analysis)? + "\n";
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.out.join("verdicts.jsonl"))
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }
}

// ── No-op implementations ─────────────────────────────────────────────────────

/// Sink that drops every action. Default for tests and dry runs.
pub struct NullActionSink;

#[async_trait]
impl ActionSink for NullActionSink {
    async fn ban_promoter(&self, _key: &EngagementKey, _reason: &str) -> Result<()> {
        Ok(())
    }
    async fn warn_promoter(&self, _key: &EngagementKey, _reason: &str) -> Result<()> {
        Ok(())
    }
    async fn monitor_promoter(&self, _key: &EngagementKey, _reason: &str) -> Result<()> {
        Ok(())
    }
}

pub struct NullVerdictStore;

#[async_trait]
impl VerdictStore for NullVerdictStore {
    async fn store_analysis(&self, _analysis: &BotAnalysis) -> Result<()> {
        Ok(())
    }
}

// ── Channel-backed record source ──────────────────────────────────────────────

/// RecordSource fed by an mpsc channel — the daemon's tail/replay tasks
/// push records in, the worker's fetch loop drains whatever has arrived
/// since its last tick.
pub struct ChannelRecordSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<ViewRecord>>,
}

impl ChannelRecordSource {
    pub fn new(rx: mpsc::Receiver<ViewRecord>) -> Self {
        Self { rx: tokio::sync::Mutex::new(rx) }
    }
}

#[async_trait]
impl RecordSource for ChannelRecordSource {
    async fn fetch_new_records(&self) -> Result<Vec<ViewRecord>> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Platform;

    fn record(i: usize) -> ViewRecord {
        ViewRecord {
            id: format!("r{i}"),
            promoter_id: "p1".into(),
            campaign_id: "c1".into(),
            platform: Platform::Instagram,
            content_id: "content".into(),
            view_count: 10,
            like_count: 1,
            comment_count: 0,
            share_count: 0,
            timestamp: Utc::now(),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "viewguard-test-{tag}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn jsonl_sink_routes_actions_to_tier_files() {
        let dir = temp_dir("sink");
        let sink = JsonlActionSink::new(&dir).unwrap();
        let key = EngagementKey::new("p1", "c1");

        sink.ban_promoter(&key, "bot score 95").await.unwrap();
        sink.monitor_promoter(&key, "bot score 25").await.unwrap();

        let bans = std::fs::read_to_string(dir.join("enforcement_actions.jsonl")).unwrap();
        let audit = std::fs::read_to_string(dir.join("audit_log.jsonl")).unwrap();
        assert_eq!(bans.lines().count(), 1);
        assert_eq!(audit.lines().count(), 2);

        let parsed: ActionLine = serde_json::from_str(bans.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.action, EnforcementAction::Ban);
        assert_eq!(parsed.promoter_id, "p1");

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn written_lines_are_visible_once_the_call_returns() {
        use crate::records::{AnalysisWindow, BotAnalysis, EngagementMetrics};

        let dir = temp_dir("store");
        let sink = JsonlActionSink::new(&dir).unwrap();
        let store = JsonlVerdictStore::new(&dir).unwrap();
        let key = EngagementKey::new("p1", "c1");
        let analysis = BotAnalysis {
            promoter_id: "p1".into(),
            campaign_id: "c1".into(),
            window: AnalysisWindow::last_minutes(10),
            metrics: EngagementMetrics::default(),
            bot_score: 95,
            action: EnforcementAction::Ban,
            reason: "bot score 95".into(),
            confidence: 95,
        };

        // Each awaited call must leave its line readable immediately —
        // no reliance on a later close finishing the write.
        for i in 0..2 {
            sink.ban_promoter(&key, "bot score 95").await.unwrap();
            store.store_analysis(&analysis).await.unwrap();
            let audit = std::fs::read_to_string(dir.join("audit_log.jsonl")).unwrap();
            let verdicts = std::fs::read_to_string(dir.join("verdicts.jsonl")).unwrap();
            assert_eq!(audit.lines().count(), i + 1);
            assert_eq!(verdicts.lines().count(), i + 1);
        }

        let back: BotAnalysis = serde_json::from_str(
            std::fs::read_to_string(dir.join("verdicts.jsonl"))
                .unwrap()
                .lines()
                .next()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(back, analysis);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn channel_source_drains_only_buffered_records() {
        let (tx, rx) = mpsc::channel(64);
        let source = ChannelRecordSource::new(rx);

        assert!(source.fetch_new_records().await.unwrap().is_empty());

        tx.send(record(0)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        assert_eq!(source.fetch_new_records().await.unwrap().len(), 2);
        assert!(source.fetch_new_records().await.unwrap().is_empty());
    }
}
