use crate::model::RunReport;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Get the base directory for storing application data.
fn base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("endpoint-probe")
}

/// Get the directory for storing run reports.
fn runs_dir() -> PathBuf {
    base_dir().join("runs")
}

pub fn ensure_dirs() -> Result<()> {
    std::fs::create_dir_all(runs_dir()).context("create runs dir")?;
    Ok(())
}

pub fn save_run(report: &RunReport) -> Result<PathBuf> {
    ensure_dirs()?;
    let path = runs_dir().join(run_file_name(report));
    let data = serde_json::to_vec_pretty(report)?;
    std::fs::write(&path, data).context("write run json")?;
    Ok(path)
}

fn run_file_name(report: &RunReport) -> String {
    let safe_ts = report.timestamp_utc.replace(':', "-").replace('T', "_");
    format!("run-{safe_ts}-{}.json", report.run_id)
}

pub fn export_json(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create export directory")?;
    }
    let data = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, data).context("write export json")?;
    Ok(())
}

pub fn export_csv(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create export directory")?;
    }
    std::fs::write(path, render_csv(report)).context("write export csv")?;
    Ok(())
}

/// One row per result: `No., URL, Ping (ms), Download Speed (Mbps)`.
pub fn render_csv(report: &RunReport) -> String {
    let mut out = String::from("No.,URL,Ping (ms),Download Speed (Mbps)\n");
    for (row, result) in report.results.iter().enumerate() {
        out.push_str(&format!(
            "{},{},{},{}\n",
            row + 1,
            csv_escape(result.target.as_str()),
            result.latency_ms.display(),
            result.throughput_mbps.display(),
        ));
    }
    out
}

/// Escape a string for CSV format (handles commas, quotes, and newlines).
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn load_recent(limit: usize) -> Result<Vec<RunReport>> {
    ensure_dirs()?;
    load_recent_from(&runs_dir(), limit)
}

fn load_recent_from(dir: &Path, limit: usize) -> Result<Vec<RunReport>> {
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for e in std::fs::read_dir(dir).context("read runs dir")? {
        let e = e?;
        let p = e.path();
        if p.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let m = e.metadata()?;
        let mt = m.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        entries.push((mt, p));
    }
    entries.sort_by_key(|(t, _)| *t);
    entries.reverse();

    let mut out = Vec::new();
    for (_, p) in entries.into_iter().take(limit) {
        let data = std::fs::read(&p).with_context(|| format!("read {}", p.display()))?;
        let r: RunReport =
            serde_json::from_slice(&data).with_context(|| format!("parse {}", p.display()))?;
        out.push(r);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Measurement, ProbeResult, RunOutcome, Target};

    fn report() -> RunReport {
        RunReport {
            version: Some("0.1.0".into()),
            timestamp_utc: "2026-01-02T03:04:05Z".into(),
            run_id: "7".into(),
            total_targets: 3,
            outcome: Some(RunOutcome::Stopped),
            results: vec![
                ProbeResult {
                    index: 0,
                    target: Target::new("http://a.example/file.bin").unwrap(),
                    latency_ms: Measurement::Measured(12.346),
                    throughput_mbps: Measurement::Measured(98.7654),
                    error: None,
                },
                ProbeResult {
                    index: 1,
                    target: Target::new("http://b.example/a,b").unwrap(),
                    latency_ms: Measurement::Unmeasured,
                    throughput_mbps: Measurement::Measured(0.0),
                    error: None,
                },
                ProbeResult {
                    index: 2,
                    target: Target::new("http://c.example").unwrap(),
                    latency_ms: Measurement::Measured(1.0),
                    throughput_mbps: Measurement::Unmeasured,
                    error: Some("request to http://c.example failed".into()),
                },
            ],
            errors: vec!["request to http://c.example failed".into()],
        }
    }

    #[test]
    fn test_render_csv() {
        let csv = render_csv(&report());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "No.,URL,Ping (ms),Download Speed (Mbps)",
                "1,http://a.example/file.bin,12.35,98.77",
                "2,\"http://b.example/a,b\",Error,0.00",
                "3,http://c.example,1.00,Error",
            ]
        );
    }

    #[test]
    fn test_export_csv_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.csv");
        export_csv(&path, &report()).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("No.,URL,Ping (ms),Download Speed (Mbps)\n"));
    }

    #[test]
    fn test_export_json_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(run_file_name(&report()));
        export_json(&path, &report()).unwrap();

        let loaded = load_recent_from(dir.path(), 10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].results, report().results);
        assert_eq!(loaded[0].outcome, Some(RunOutcome::Stopped));
    }

    #[test]
    fn test_run_file_name_is_path_safe() {
        assert_eq!(run_file_name(&report()), "run-2026-01-02_03-04-05Z-7.json");
    }
}
