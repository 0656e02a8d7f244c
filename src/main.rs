// src/main.rs
//
// Georisk — real-time geolocation risk fusion
//
// Two operational modes:
//   tail    — tail a JSONL location feed (production / staging)
//   replay  — replay a captured feed at scaled speed (testing/research)
//
// Usage:
//   georisk --mode tail --path /var/log/geo/feed.jsonl --zones zones.geojson
//   georisk --mode replay --path captured.jsonl --speed 10.0 --model model.json

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod errors;
mod events;
mod features;
mod geo;
mod hotspot;
mod model;
mod state;

use config::Config;
use engine::pipeline::RiskPipeline;
use events::{FusedResult, Sample};
use hotspot::HotspotIndex;
use model::{Capabilities, JsonlSink, LinearModel};
use state::zones::GeofenceRegistry;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "georisk",
    about   = "Real-time geolocation risk fusion",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/georisk_feed.jsonl",
          help = "JSONL location feed (tail/replay modes)")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,

    #[arg(long, help = "Static geofence zones file (JSON array of zone specs)")]
    zones: Option<PathBuf>,

    #[arg(long, help = "Incident reports JSONL for building the hotspot grid")]
    reports: Option<PathBuf>,

    #[arg(long, help = "Hotspot grid snapshot (loaded when --reports is absent, \
                        written after a build)")]
    hotspot_index: Option<PathBuf>,

    #[arg(long, help = "Model artifact (JSON)")]
    model: Option<PathBuf>,

    #[arg(long, default_value = "/tmp/georisk_output",
          help = "Scored-results output directory")]
    output: PathBuf,

    #[arg(long, help = "Config file (JSON), defaults applied when absent")]
    config: Option<PathBuf>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,    // tail a live JSONL feed
    Replay,  // replay a static JSONL file at scaled speed
}

// ── Terminal output ──────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("   ██████╗ ███████╗ ██████╗ ██████╗ ██╗███████╗██╗  ██╗");
    println!("  ██╔════╝ ██╔════╝██╔═══██╗██╔══██╗██║██╔════╝██║ ██╔╝");
    println!("  ██║  ███╗█████╗  ██║   ██║██████╔╝██║███████╗█████╔╝ ");
    println!("  ██║   ██║██╔══╝  ██║   ██║██╔══██╗██║╚════██║██╔═██╗ ");
    println!("  ╚██████╔╝███████╗╚██████╔╝██║  ██║██║███████║██║  ██╗");
    println!("   ╚═════╝ ╚══════╝ ╚═════╝ ╚═╝  ╚═╝╚═╝╚══════╝╚═╝  ╚═╝");
    println!("\x1b[0m");
    println!("  \x1b[90mReal-time geolocation risk fusion | Rust\x1b[0m\n");
}

fn print_alert(result: &FusedResult) {
    let (color, icon) = if result.final_risk >= 0.8 {
        ("\x1b[91;1m", "🔴")
    } else {
        ("\x1b[93;1m", "🟡")
    };
    let reset = "\x1b[0m";
    let reasons = result
        .reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" | ");
    let zone = result
        .zone
        .as_ref()
        .map(|z| format!("{} ({})", z.name, z.risk_level))
        .unwrap_or_else(|| "-".into());

    println!("\n{}{} risk {:.3}{}", color, icon, result.final_risk, reset);
    println!("  Session : {}{}{}", color, result.session_id, reset);
    println!("  User    : {}", result.user_id);
    println!("  Position: {:.5}, {:.5}", result.lat, result.lon);
    println!("  Zone    : {}", zone);
    println!("  Reasons : {}", reasons);
}

async fn print_stats_loop(pipeline: Arc<RiskPipeline>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let samples = pipeline.total_samples();
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  samples={}  sps={:.1}  sessions={} ──\x1b[0m",
            elapsed,
            samples,
            samples as f64 / elapsed,
            pipeline.n_sessions(),
        );
    }
}

// ── Sample sources ───────────────────────────────────────────────────────────

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<Sample>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {}  // consume existing
    }

    info!("Tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim().to_string();
                if line.is_empty() { continue; }
                match serde_json::from_str::<Sample>(&line) {
                    Ok(s) => { if tx.send(s).await.is_err() { break; } }
                    Err(e) => warn!("Parse error: {}", e),
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<Sample>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    let mut samples: Vec<(f64, Sample)> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() { continue; }
        if let Ok(s) = serde_json::from_str::<Sample>(line) {
            let ts = s.timestamp.timestamp_millis() as f64;
            samples.push((ts, s));
        }
    }

    if samples.is_empty() { return Ok(()); }
    samples.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    let base_ts = samples[0].0;
    let base_wall = Instant::now();

    for (ts, sample) in samples {
        let offset = (ts - base_ts) / speed / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset);
        let now = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        if tx.send(sample).await.is_err() { break; }
    }
    Ok(())
}

// ── Setup ────────────────────────────────────────────────────────────────────

fn build_hotspot(cli: &Cli, config: &Config) -> Result<Option<Arc<HotspotIndex>>> {
    if let Some(reports_path) = &cli.reports {
        let reports = hotspot::load_reports(reports_path)?;
        let index = HotspotIndex::build(&reports, config.grid_size);
        info!(
            "Built hotspot grid: {} reports, {} cells at {}°",
            reports.len(),
            index.n_cells(),
            index.grid_size()
        );
        if let Some(snapshot_path) = &cli.hotspot_index {
            index.save(snapshot_path)?;
            info!("Saved hotspot snapshot to {}", snapshot_path.display());
        }
        return Ok(Some(Arc::new(index)));
    }
    if let Some(snapshot_path) = &cli.hotspot_index {
        if let Some(index) = HotspotIndex::load(snapshot_path)? {
            info!(
                "Loaded hotspot snapshot: {} cells ({})",
                index.n_cells(),
                snapshot_path.display()
            );
            return Ok(Some(Arc::new(index)));
        }
        warn!("No hotspot snapshot at {}", snapshot_path.display());
    }
    Ok(None)
}

fn build_capabilities(cli: &Cli) -> Result<Capabilities> {
    let mut capabilities = Capabilities::default();

    if let Some(model_path) = &cli.model {
        let model = Arc::new(LinearModel::from_path(model_path)?);
        info!("Loaded model artifact from {}", model_path.display());
        capabilities.anomaly = Some(model.clone());
        capabilities.density = Some(model.clone());
        capabilities.explainer = Some(model);
    } else {
        warn!("No model artifact: anomaly and cluster signals will stay neutral");
    }

    capabilities.sink = Some(Arc::new(JsonlSink::new(&cli.output)?));
    Ok(capabilities)
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("georisk=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading config")?;

    print_banner();

    let registry = Arc::new(GeofenceRegistry::new(std::time::Duration::from_secs(
        config.sweep_interval_secs,
    )));
    if let Some(zones_path) = &cli.zones {
        let n = registry.load_static_file(zones_path)?;
        info!("Loaded {} static zones from {}", n, zones_path.display());
    } else {
        warn!("No zones file: geofence and open-water signals limited");
    }

    let hotspot = build_hotspot(&cli, &config)?;
    let capabilities = build_capabilities(&cli)?;
    let alert_threshold = config.alert_threshold;

    let pipeline = Arc::new(RiskPipeline::new(
        config,
        Arc::clone(&registry),
        hotspot,
        capabilities,
    ));
    let start = Instant::now();
    let (tx, mut rx) = mpsc::channel::<Sample>(16384);

    // Stats printer
    tokio::spawn(print_stats_loop(Arc::clone(&pipeline), start));

    // Dynamic-zone expiry sweeper
    tokio::spawn(Arc::clone(&registry).sweep_loop());

    // Sample source
    match cli.mode {
        Mode::Tail => {
            println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.path.display());
            println!("  Output: \x1b[90m{}\x1b[0m\n", cli.output.display());
            let path = cli.path.clone();
            tokio::spawn(async move { tail_jsonl(path, tx, true).await.ok(); });
        }

        Mode::Replay => {
            println!("  Mode: \x1b[93mREPLAY\x1b[0m  |  {}  speed={:.1}x", cli.path.display(), cli.speed);
            println!("  Output: \x1b[90m{}\x1b[0m\n", cli.output.display());
            let path = cli.path.clone();
            let speed = cli.speed;
            tokio::spawn(async move { replay_jsonl(path, tx, speed).await.ok(); });
        }
    }

    println!("  Press Ctrl+C to stop.\n");

    // Main consumer — spawn one task per sample for parallelism
    while let Some(sample) = rx.recv().await {
        let p = Arc::clone(&pipeline);
        tokio::spawn(async move {
            match p.ingest_and_score(&sample) {
                Ok(result) if result.final_risk >= alert_threshold => print_alert(&result),
                Ok(_) => {}
                Err(e) => warn!("Rejected sample: {}", e),
            }
        });
    }

    Ok(())
}
