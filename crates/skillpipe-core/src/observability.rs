//! Observability: tracing init and the dispatch audit log.
//!
//! Uses config::ObservabilityConfig for SKILLPIPE_QUIET, LOG_LEVEL, LOG_JSON, AUDIT_LOG.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::catalog::RiskLevel;

static AUDIT_PATH: Mutex<Option<String>> = Mutex::new(None);

/// Tracing initialization mode.
#[derive(Clone, Copy)]
pub enum TracingMode {
    /// Default: use SKILLPIPE_LOG_LEVEL / SKILLPIPE_QUIET from env
    Default,
    /// Interactive CLI: suppress pipeline-internal WARN (LLM fallbacks, retries) to keep output clean
    Interactive,
}

/// Initialize tracing. Call at process startup.
/// When SKILLPIPE_QUIET=1, only WARN and above are logged.
pub fn init_tracing(mode: TracingMode) {
    let cfg = crate::config::ObservabilityConfig::from_env();
    let mut level: String = if cfg.quiet {
        "skillpipe=warn".to_string()
    } else {
        cfg.log_level.clone()
    };

    if matches!(mode, TracingMode::Interactive) {
        level = format!("{},skillpipe_agent=error", level);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let _ = if cfg.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    };
}

fn get_audit_path() -> Option<String> {
    {
        let guard = AUDIT_PATH.lock().ok()?;
        if let Some(ref p) = *guard {
            return Some(p.clone());
        }
    }
    let path = crate::config::ObservabilityConfig::from_env().audit_log.clone()?;
    if let Some(parent) = Path::new(&path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    {
        let mut guard = AUDIT_PATH.lock().ok()?;
        *guard = Some(path.clone());
    }
    Some(path)
}

fn append_jsonl(path: &str, record: &serde_json::Value) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(f, "{}", line);
        }
    }
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Audit: dispatch_started (right before the handler is invoked)
pub fn audit_dispatch_started(task_id: &str, tool_id: &str, risk: RiskLevel, attempt: u32) {
    if let Some(path) = get_audit_path() {
        let record = json!({
            "ts": now_ts(),
            "event": "dispatch_started",
            "task_id": task_id,
            "tool_id": tool_id,
            "risk_level": risk,
            "attempt": attempt,
        });
        append_jsonl(&path, &record);
    }
}

/// Audit: dispatch_completed (success or captured failure)
pub fn audit_dispatch_completed(
    task_id: &str,
    tool_id: &str,
    success: bool,
    duration_ms: u64,
    error: Option<&str>,
) {
    if let Some(path) = get_audit_path() {
        let record = json!({
            "ts": now_ts(),
            "event": "dispatch_completed",
            "task_id": task_id,
            "tool_id": tool_id,
            "success": success,
            "duration_ms": duration_ms,
            "error": error,
        });
        append_jsonl(&path, &record);
    }
}

/// Audit: dispatch_rejected (permission or confirmation gate, before any side effect)
pub fn audit_dispatch_rejected(task_id: &str, tool_id: &str, reason: &str) {
    if let Some(path) = get_audit_path() {
        let record = json!({
            "ts": now_ts(),
            "event": "dispatch_rejected",
            "task_id": task_id,
            "tool_id": tool_id,
            "reason": reason,
        });
        append_jsonl(&path, &record);
    }
}
