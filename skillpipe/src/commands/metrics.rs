//! `skillpipe metrics`: per-stage latency aggregates from telemetry.

use anyhow::{Context, Result};

use skillpipe_core::records::Stage;
use skillpipe_telemetry::{PerformanceMonitor, StageSummary, TimeWindow};

use super::open_telemetry;

pub fn cmd_metrics(stage: Option<&str>, since_hours: Option<i64>, json: bool) -> Result<()> {
    let window = match since_hours {
        Some(h) if h > 0 => TimeWindow::Last(chrono::Duration::hours(h)),
        Some(h) => anyhow::bail!("--since-hours must be positive, got {}", h),
        None => TimeWindow::All,
    };
    let monitor = PerformanceMonitor::new(open_telemetry());
    let summaries: Vec<StageSummary> = match stage {
        Some(raw) => {
            let stage = Stage::parse(raw).with_context(|| {
                format!(
                    "Unknown stage '{}' (expected one of: {})",
                    raw,
                    Stage::ALL.map(|s| s.as_str()).join(", ")
                )
            })?;
            vec![monitor.query(stage, window)?]
        }
        None => monitor.query_all(window)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    println!(
        "{:<12} {:>7} {:>9} {:>7} {:>7} {:>7} {:>7}",
        "stage", "count", "avg_ms", "p50", "p95", "min", "max"
    );
    for s in &summaries {
        println!(
            "{:<12} {:>7} {:>9.1} {:>7} {:>7} {:>7} {:>7}",
            s.stage.as_str(),
            s.count,
            s.avg_ms,
            s.p50_ms,
            s.p95_ms,
            s.min_ms,
            s.max_ms
        );
    }
    Ok(())
}
