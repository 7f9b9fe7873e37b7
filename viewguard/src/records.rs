// viewguard/src/records.rs
//
// Shared domain types flowing through Viewguard: engagement snapshots
// reported by the external collector, the verdicts the scoring engine
// produces for them, and the stats snapshots the daemon exposes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Inbound engagement data ───────────────────────────────────────────────────

/// Source platform the engagement counters were reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Tiktok,
    Instagram,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tiktok => write!(f, "tiktok"),
            Self::Instagram => write!(f, "instagram"),
        }
    }
}

/// One observed engagement snapshot for a piece of promoted content.
/// Counters are cumulative as reported by the platform, not deltas.
/// Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRecord {
    pub id: String,
    pub promoter_id: String,
    pub campaign_id: String,
    pub platform: Platform,
    pub content_id: String,
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
    pub share_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl ViewRecord {
    pub fn key(&self) -> EngagementKey {
        EngagementKey::new(&self.promoter_id, &self.campaign_id)
    }

    /// Boundary validation — a record without its key fields can never be
    /// attributed to a queue and is rejected rather than coerced.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.promoter_id.is_empty() || self.campaign_id.is_empty() {
            return Err(EngineError::InvalidRecord {
                id: self.id.clone(),
                reason: "empty promoter or campaign id".into(),
            });
        }
        Ok(())
    }
}

/// Typed composite key for all per-(promoter, campaign) state.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementKey {
    pub promoter_id: String,
    pub campaign_id: String,
}

impl EngagementKey {
    pub fn new(promoter_id: impl Into<String>, campaign_id: impl Into<String>) -> Self {
        Self {
            promoter_id: promoter_id.into(),
            campaign_id: campaign_id.into(),
        }
    }
}

impl std::fmt::Display for EngagementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.promoter_id, self.campaign_id)
    }
}

// ── Analysis window ───────────────────────────────────────────────────────────

/// Closed time interval [start, end] over which metrics are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AnalysisWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window covering the last `minutes` ending now.
    pub fn last_minutes(minutes: i64) -> Self {
        let end = Utc::now();
        Self { start: end - Duration::minutes(minutes), end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Window length in minutes, clamped away from zero so per-minute
    /// rates on degenerate windows stay finite.
    pub fn minutes(&self) -> f64 {
        ((self.end - self.start).num_milliseconds() as f64 / 60_000.0).max(1.0 / 60_000.0)
    }
}

// ── Verdicts ──────────────────────────────────────────────────────────────────

/// Escalation tier, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    None,
    Monitor,
    Warning,
    Ban,
}

impl std::fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Monitor => write!(f, "MONITOR"),
            Self::Warning => write!(f, "WARNING"),
            Self::Ban => write!(f, "BAN"),
        }
    }
}

/// Aggregated metrics for one verdict's window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub avg_views_per_minute: f64,
    pub avg_likes_per_minute: f64,
    pub avg_comments_per_minute: f64,
    pub view_like_ratio: f64,
    pub view_comment_ratio: f64,
    pub spike_detected: bool,
    pub spike_percentage: Option<f64>,
    pub total_views: u64,
    pub total_likes: u64,
    pub total_comments: u64,
}

/// The verdict for one (promoter, campaign) pair over one window.
/// Never mutated after creation; superseded by the next computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotAnalysis {
    pub promoter_id: String,
    pub campaign_id: String,
    pub window: AnalysisWindow,
    pub metrics: EngagementMetrics,
    /// Confidence 0–100 that the activity is automated/manipulated.
    pub bot_score: u8,
    pub action: EnforcementAction,
    pub reason: String,
    /// Mirrors bot_score.
    pub confidence: u8,
}

impl BotAnalysis {
    pub fn key(&self) -> EngagementKey {
        EngagementKey::new(&self.promoter_id, &self.campaign_id)
    }
}

/// Cached verdict. Entries older than their TTL are treated as absent.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub analysis: BotAnalysis,
    pub cached_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.cached_at).num_seconds() < self.ttl_seconds as i64
    }
}

/// What `analyze_immediate` hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis: BotAnalysis,
    pub action_taken: bool,
    pub action_type: Option<EnforcementAction>,
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
}

// ── Stats snapshots ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerStats {
    /// Sum of queued records across all keys.
    pub queued_records: usize,
    pub cached_verdicts: usize,
    pub is_running: bool,
    /// Keys with a recorded last-analysis time.
    pub tracked_keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub records_processed: u64,
    pub analyses_performed: u64,
    pub actions_triggered: u64,
    pub error_count: u64,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_analysis: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub uptime_seconds: u64,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
    #[error("invalid key {0}: promoter and campaign ids must be non-empty")]
    InvalidKey(EngagementKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(promoter: &str, campaign: &str) -> ViewRecord {
        ViewRecord {
            id: "r1".into(),
            promoter_id: promoter.into(),
            campaign_id: campaign.into(),
            platform: Platform::Tiktok,
            content_id: "c1".into(),
            view_count: 10,
            like_count: 2,
            comment_count: 1,
            share_count: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn key_display_and_equality() {
        let k = record("p1", "c1").key();
        assert_eq!(k, EngagementKey::new("p1", "c1"));
        assert_eq!(k.to_string(), "p1:c1");
    }

    #[test]
    fn validation_rejects_empty_key_fields() {
        assert!(record("p1", "c1").validate().is_ok());
        assert!(record("", "c1").validate().is_err());
        assert!(record("p1", "").validate().is_err());
    }

    #[test]
    fn action_severity_ordering() {
        assert!(EnforcementAction::None < EnforcementAction::Monitor);
        assert!(EnforcementAction::Monitor < EnforcementAction::Warning);
        assert!(EnforcementAction::Warning < EnforcementAction::Ban);
    }

    #[test]
    fn window_contains_is_closed_interval() {
        let start = Utc::now();
        let end = start + Duration::minutes(10);
        let w = AnalysisWindow::new(start, end);
        assert!(w.contains(start));
        assert!(w.contains(end));
        assert!(!w.contains(end + Duration::seconds(1)));
        assert!((w.minutes() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn cache_entry_freshness() {
        let entry = CacheEntry {
            analysis: BotAnalysis {
                promoter_id: "p1".into(),
                campaign_id: "c1".into(),
                window: AnalysisWindow::last_minutes(10),
                metrics: EngagementMetrics::default(),
                bot_score: 0,
                action: EnforcementAction::None,
                reason: String::new(),
                confidence: 0,
            },
            cached_at: Utc::now(),
            ttl_seconds: 300,
        };
        assert!(entry.is_fresh(Utc::now()));
        assert!(!entry.is_fresh(Utc::now() + Duration::seconds(301)));
    }

    #[test]
    fn view_record_jsonl_round_trip() {
        let r = record("p1", "c1");
        let line = serde_json::to_string(&r).unwrap();
        assert!(line.contains("\"tiktok\""));
        let back: ViewRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, r);
    }
}
