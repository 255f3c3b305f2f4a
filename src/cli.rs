use crate::engine::ProbeEngine;
use crate::model::{ProbeConfig, ProbeEvent, ProbeResult, RunOutcome, RunReport};
use crate::report::ResultAggregator;
use crate::stats::{latency_grade, summarize, throughput_grade, Grade};
use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "endpoint-probe",
    version,
    about = "Measure ping latency and download speed for a list of URLs"
)]
pub struct Cli {
    /// Text file with one URL per line
    #[arg(required_unless_present = "history")]
    pub targets: Option<PathBuf>,

    /// Print JSON report and exit (no per-target output)
    #[arg(long)]
    pub json: bool,

    /// Timeout for the ping probe
    #[arg(long, default_value = "2s")]
    pub ping_timeout: humantime::Duration,

    /// Connect and read timeout for the download probe
    #[arg(long, default_value = "10s")]
    pub download_timeout: humantime::Duration,

    /// Bytes to download per target before computing speed
    #[arg(long, default_value_t = 102_400)]
    pub sample_bytes: u64,

    /// Export results as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Export results as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// List the N most recent saved runs and exit
    #[arg(long, value_name = "N")]
    pub history: Option<usize>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

pub fn init_logging(args: &Cli) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Warn,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_secs()
        .init();
}

pub async fn run(args: Cli) -> Result<()> {
    if let Some(limit) = args.history {
        return print_history(limit);
    }

    let path = args
        .targets
        .as_deref()
        .context("a target list file is required")?;
    let targets = crate::targets::load_targets(path)?;
    let total = targets.len();

    let cfg = build_config(&args);
    let engine = ProbeEngine::new(&cfg).context("failed to set up probes")?;
    let cancel = engine.cancel_handle();

    let (evt_tx, mut evt_rx) = mpsc::channel::<ProbeEvent>(1024);
    let handle = engine.spawn(targets, evt_tx);

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping test...");
            cancel.cancel();
        }
    });

    if !args.json {
        eprintln!("Testing {} URLs...", total);
        print_header();
    }

    let mut aggregator = ResultAggregator::new();
    while let Some(ev) = evt_rx.recv().await {
        if !args.json {
            print_event(&ev);
        }
        let done = matches!(ev, ProbeEvent::Done { .. });
        aggregator.apply(ev);
        if done {
            break;
        }
    }

    // The spawned run owns the sender and hands it back on exit
    handle.await.context("probe task failed")?;
    ctrl_c.abort();
    if !aggregator.is_finished() {
        log::warn!("Event stream ended before the run reported completion");
    }
    log::info!(
        "Run finished: {:?} at {}%, {} results, {} errors",
        aggregator.outcome(),
        aggregator.last_progress().unwrap_or(0),
        aggregator.results().len(),
        aggregator.errors().len()
    );

    let report = aggregator.into_report(gen_run_id(), total);

    handle_exports(&args, &report)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if args.auto_save {
        match crate::storage::save_run(&report) {
            Ok(p) => eprintln!("Saved: {}", p.display()),
            Err(e) => log::warn!("Failed to save run: {:#}", e),
        }
    }

    Ok(())
}

/// Generate a random identifier for a run.
fn gen_run_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

/// Build a `ProbeConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ProbeConfig {
    ProbeConfig {
        ping_timeout: Duration::from(args.ping_timeout),
        download_timeout: Duration::from(args.download_timeout),
        sample_bytes: args.sample_bytes.max(1),
        ..ProbeConfig::default()
    }
}

fn print_header() {
    println!(
        "{:>4}  {:<48}  {:>14}  {:>22}",
        "No.", "URL", "Ping (ms)", "Download Speed (Mbps)"
    );
}

fn print_event(ev: &ProbeEvent) {
    match ev {
        ProbeEvent::Result { result } => println!("{}", format_row(result)),
        ProbeEvent::Progress { percent } => eprintln!("Testing... {}%", percent),
        ProbeEvent::Error { message, .. } => eprintln!("{}", message),
        ProbeEvent::Done { outcome } => match outcome {
            RunOutcome::Completed => eprintln!("Test completed successfully"),
            RunOutcome::Stopped => eprintln!("Test stopped by user"),
            RunOutcome::Crashed => eprintln!("Test aborted after an internal error"),
        },
    }
}

fn graded(value: String, grade: Option<Grade>) -> String {
    match grade {
        Some(g) => format!("{} ({})", value, g.label()),
        None => value,
    }
}

fn format_row(result: &ProbeResult) -> String {
    format!(
        "{:>4}  {:<48}  {:>14}  {:>22}",
        result.index + 1,
        result.target.as_str(),
        graded(result.latency_ms.display(), latency_grade(result.latency_ms)),
        graded(
            result.throughput_mbps.display(),
            throughput_grade(result.throughput_mbps)
        ),
    )
}

fn print_summary(report: &RunReport) {
    let s = summarize(&report.results);
    let fmt = |v: Option<f64>| v.map(|x| format!("{:.2}", x)).unwrap_or_else(|| "-".into());
    println!();
    println!("Processed: {}/{}", s.processed, report.total_targets);
    println!(
        "Ping (ms): measured {} min {} med {} max {} stddev {}",
        s.latency_ms.count,
        fmt(s.latency_ms.min),
        fmt(s.latency_ms.median),
        fmt(s.latency_ms.max),
        fmt(s.latency_ms.stddev)
    );
    println!(
        "Download (Mbps): measured {} avg {} med {} max {}",
        s.throughput_mbps.count,
        fmt(s.throughput_mbps.mean),
        fmt(s.throughput_mbps.median),
        fmt(s.throughput_mbps.max)
    );
    let incomplete = count_incomplete(&report.results);
    if incomplete > 0 {
        println!("Incomplete: {}", incomplete);
    }
    if !report.errors.is_empty() {
        println!("Errors: {}", report.errors.len());
    }
}

/// Rows where at least one of the two measurements is missing.
fn count_incomplete(results: &[ProbeResult]) -> usize {
    results
        .iter()
        .filter(|r| !r.latency_ms.is_measured() || !r.throughput_mbps.is_measured())
        .count()
}

fn print_history(limit: usize) -> Result<()> {
    let runs = crate::storage::load_recent(limit).context("failed to load saved runs")?;
    if runs.is_empty() {
        println!("No saved runs");
        return Ok(());
    }
    for run in runs {
        let s = summarize(&run.results);
        println!(
            "{}  {:?}  {}/{} targets  ping med {}  download avg {}",
            run.timestamp_utc,
            run.outcome,
            s.processed,
            run.total_targets,
            s.latency_ms
                .median
                .map(|v| format!("{:.2} ms", v))
                .unwrap_or_else(|| "-".into()),
            s.throughput_mbps
                .mean
                .map(|v| format!("{:.2} Mbps", v))
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

/// Handle export operations (CSV and JSON).
fn handle_exports(args: &Cli, report: &RunReport) -> Result<()> {
    if let Some(p) = args.export_csv.as_deref() {
        crate::storage::export_csv(p, report)?;
    }
    if let Some(p) = args.export_json.as_deref() {
        crate::storage::export_json(p, report)?;
    }
    Ok(())
}
