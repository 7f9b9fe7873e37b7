// viewguard/src/main.rs
//
// Viewguard — real-time engagement-fraud scoring and response daemon.
//
// Two operational modes:
//   tail    — follow a JSONL feed of ViewRecords (production/staging)
//   replay  — replay a captured feed at scaled speed (testing/research)
//
// Usage:
//   viewguard --mode tail --path /var/log/engagement/feed.jsonl
//   viewguard --mode replay --path captured.jsonl --speed 10.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod engine;
mod records;
mod scoring;
mod worker;

use engine::analyzer::{AnalyzerConfig, RealTimeAnalyzer};
use engine::dispatcher::{ActionSink, ChannelRecordSource, JsonlActionSink, JsonlVerdictStore};
use records::{EngagementKey, EnforcementAction, ViewRecord};
use scoring::ScoringEngine;
use worker::{BackgroundWorker, WorkerConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "viewguard",
    about   = "Real-time engagement-fraud scoring and response engine",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/viewguard_feed.jsonl",
          help = "JSONL ViewRecord feed path")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,

    #[arg(long, default_value = "/tmp/viewguard_output",
          help = "Enforcement output directory")]
    output: PathBuf,

    #[arg(long, default_value = "30", help = "Data fetch interval in seconds")]
    fetch_interval: u64,

    #[arg(long, default_value = "60", help = "Scheduled analysis interval in seconds")]
    analysis_interval: u64,

    #[arg(long, help = "Compute and store verdicts but dispatch no actions")]
    no_actions: bool,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,   // follow a live JSONL feed
    Replay, // replay a static JSONL file at scaled speed
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m  viewguard\x1b[0m — engagement-fraud scoring and response engine");
    println!("  \x1b[90mviews | likes | comments in, none/monitor/warning/ban out\x1b[0m\n");
}

fn print_alert(action: EnforcementAction, key: &EngagementKey, reason: &str) {
    let (color, icon) = match action {
        EnforcementAction::Ban => ("\x1b[91;1m", "!!"),
        EnforcementAction::Warning => ("\x1b[93;1m", "! "),
        EnforcementAction::Monitor => ("\x1b[96m", "? "),
        EnforcementAction::None => ("\x1b[92m", "  "),
    };
    let reset = "\x1b[0m";
    println!("\n{color}{icon} {action}{reset}  {key}");
    println!("   {color}{reason}{reset}");
}

/// Sink wrapper: print the alert, then delegate to the JSONL sink.
struct ConsoleSink {
    inner: JsonlActionSink,
}

#[async_trait]
impl ActionSink for ConsoleSink {
    async fn ban_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()> {
        print_alert(EnforcementAction::Ban, key, reason);
        self.inner.ban_promoter(key, reason).await
    }
    async fn warn_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()> {
        print_alert(EnforcementAction::Warning, key, reason);
        self.inner.warn_promoter(key, reason).await
    }
    async fn monitor_promoter(&self, key: &EngagementKey, reason: &str) -> Result<()> {
        print_alert(EnforcementAction::Monitor, key, reason);
        self.inner.monitor_promoter(key, reason).await
    }
}

async fn print_stats_loop(worker: Arc<BackgroundWorker>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        let stats = worker.get_stats();
        let queue = worker.analyzer().get_statistics();
        println!(
            "\n\x1b[1m── stats  uptime={}s  records={}  analyses={}  actions={}  errors={}  queued={} ──\x1b[0m",
            stats.uptime_seconds,
            stats.records_processed,
            stats.analyses_performed,
            stats.actions_triggered,
            stats.error_count,
            queue.queued_records,
        );
    }
}

// ── Feed sources ──────────────────────────────────────────────────────────────

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<ViewRecord>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {} // consume existing
    }

    info!("tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ViewRecord>(line) {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("feed parse error: {e}"),
                }
            }
            None => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<ViewRecord>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    let mut feed: Vec<(i64, ViewRecord)> = content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            serde_json::from_str::<ViewRecord>(line)
                .ok()
                .map(|r| (r.timestamp.timestamp_millis(), r))
        })
        .collect();

    if feed.is_empty() {
        return Ok(());
    }
    feed.sort_by_key(|(ts, _)| *ts);

    let base_ts = feed[0].0;
    let base_wall = std::time::Instant::now();

    for (ts, mut record) in feed {
        let offset = (ts - base_ts) as f64 / speed / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset.max(0.0));
        let now = std::time::Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        record.timestamp = Utc::now();
        if tx.send(record).await.is_err() {
            break;
        }
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("viewguard=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    print_banner();

    let sink = Arc::new(ConsoleSink { inner: JsonlActionSink::new(&cli.output)? });
    let store = Arc::new(JsonlVerdictStore::new(&cli.output)?);

    let analyzer = Arc::new(RealTimeAnalyzer::new(
        AnalyzerConfig {
            analysis_interval: std::time::Duration::from_secs(cli.analysis_interval),
            enable_auto_actions: !cli.no_actions,
            ..AnalyzerConfig::default()
        },
        ScoringEngine::default(),
        sink,
        store,
    ));

    let (tx, rx) = mpsc::channel::<ViewRecord>(16384);
    let source = Arc::new(ChannelRecordSource::new(rx));

    let worker = Arc::new(BackgroundWorker::new(
        WorkerConfig {
            data_fetch_interval: std::time::Duration::from_secs(cli.fetch_interval),
            ..WorkerConfig::default()
        },
        analyzer,
        source,
    ));
    Arc::clone(&worker).start();

    tokio::spawn(print_stats_loop(Arc::clone(&worker)));

    match cli.mode {
        Mode::Tail => {
            println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.path.display());
            println!("  Output: \x1b[90m{}\x1b[0m\n", cli.output.display());
            let path = cli.path.clone();
            tokio::spawn(async move { tail_jsonl(path, tx, true).await.ok() });
        }
        Mode::Replay => {
            println!(
                "  Mode: \x1b[93mREPLAY\x1b[0m  |  {}  speed={:.1}x",
                cli.path.display(),
                cli.speed
            );
            println!("  Output: \x1b[90m{}\x1b[0m\n", cli.output.display());
            let path = cli.path.clone();
            let speed = cli.speed;
            tokio::spawn(async move { replay_jsonl(path, tx, speed).await.ok() });
        }
    }

    println!("  Press Ctrl+C to stop.\n");
    tokio::signal::ctrl_c().await?;
    worker.stop();
    info!("shutdown complete");
    Ok(())
}
