//! skillpipe-telemetry: append-only persistence for slot history, execution
//! logs and stage metrics, plus the [`PerformanceMonitor`] built on top.
//!
//! Writes are best-effort: callers go through [`record_best_effort`], which
//! logs a failed insert and carries on.

mod background;
mod jsonl;
mod memory;
mod monitor;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use skillpipe_core::config::{TelemetryBackend, TelemetryConfig};
use skillpipe_core::records::{PerformanceMetric, SlotHistoryEntry, Stage, ToolExecutionRecord};

pub use background::BackgroundStore;
pub use jsonl::JsonlStore;
pub use memory::{MemoryStore, NullStore};
pub use monitor::{PerformanceMonitor, StageSummary, StageTimer, TimeWindow};
pub use sqlite::SqliteStore;

/// One appended telemetry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    SlotResolution(SlotHistoryEntry),
    Execution(ToolExecutionRecord),
    Metric(PerformanceMetric),
}

impl TelemetryRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            TelemetryRecord::SlotResolution(_) => RecordKind::SlotResolution,
            TelemetryRecord::Execution(_) => RecordKind::Execution,
            TelemetryRecord::Metric(_) => RecordKind::Metric,
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            TelemetryRecord::SlotResolution(e) => e.recorded_at,
            TelemetryRecord::Execution(e) => e.recorded_at,
            TelemetryRecord::Metric(m) => m.recorded_at,
        }
    }

    /// Task the record belongs to. Metrics are turn-level and have none.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TelemetryRecord::SlotResolution(e) => Some(&e.task_id),
            TelemetryRecord::Execution(e) => Some(&e.task_id),
            TelemetryRecord::Metric(_) => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            TelemetryRecord::Metric(m) => Some(m.stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    SlotResolution,
    Execution,
    Metric,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::SlotResolution,
        RecordKind::Execution,
        RecordKind::Metric,
    ];
}

/// Query filter. Unset fields match everything.
///
/// `stage` only matches metrics and `task_id` only matches slot and
/// execution records. `limit` keeps the newest N records; results are
/// always returned oldest first.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub stage: Option<Stage>,
    pub task_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn kind(kind: RecordKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn stage(stage: Stage) -> Self {
        Self {
            kind: Some(RecordKind::Metric),
            stage: Some(stage),
            ..Default::default()
        }
    }

    /// Kinds this filter can possibly match.
    pub(crate) fn kinds(&self) -> Vec<RecordKind> {
        RecordKind::ALL
            .into_iter()
            .filter(|k| self.kind.map_or(true, |want| want == *k))
            .filter(|k| self.stage.is_none() || *k == RecordKind::Metric)
            .filter(|k| self.task_id.is_none() || *k != RecordKind::Metric)
            .collect()
    }

    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        if !self.kinds().contains(&record.kind()) {
            return false;
        }
        if let Some(stage) = self.stage {
            if record.stage() != Some(stage) {
                return false;
            }
        }
        if let Some(ref task) = self.task_id {
            if record.task_id() != Some(task.as_str()) {
                return false;
            }
        }
        let at = record.recorded_at();
        if self.since.is_some_and(|since| at < since) {
            return false;
        }
        if self.until.is_some_and(|until| at > until) {
            return false;
        }
        true
    }
}

/// Sort oldest first and keep the newest `limit`.
pub(crate) fn finish_query(
    mut records: Vec<TelemetryRecord>,
    limit: Option<usize>,
) -> Vec<TelemetryRecord> {
    records.sort_by_key(|r| r.recorded_at());
    if let Some(limit) = limit {
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
    }
    records
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Telemetry store lock poisoned")]
    Poisoned,

    #[error("Telemetry writer thread stopped")]
    WriterStopped,
}

/// Append-only persistent store.
pub trait TelemetryStore: Send + Sync {
    fn insert(&self, record: &TelemetryRecord) -> Result<(), StoreError>;

    fn query(&self, filter: &RecordFilter) -> Result<Vec<TelemetryRecord>, StoreError>;
}

/// Insert, logging and swallowing any failure.
pub fn record_best_effort(store: &dyn TelemetryStore, record: &TelemetryRecord) {
    if let Err(e) = store.insert(record) {
        tracing::warn!(kind = ?record.kind(), "telemetry write failed: {}", e);
    }
}

/// Open the store selected by config. Disk backends are written from a
/// background thread; a backend that fails to open degrades to
/// [`NullStore`] with a warning.
pub fn open_store(config: &TelemetryConfig) -> Arc<dyn TelemetryStore> {
    match config.backend {
        TelemetryBackend::Sqlite => {
            let path = config.data_dir.join("telemetry.db");
            match SqliteStore::open(&path) {
                Ok(store) => off_thread(Arc::new(store)),
                Err(e) => degraded("sqlite", &path, e),
            }
        }
        TelemetryBackend::Jsonl => {
            let dir = config.data_dir.join("telemetry");
            match JsonlStore::open(&dir) {
                Ok(store) => off_thread(Arc::new(store)),
                Err(e) => degraded("jsonl", &dir, e),
            }
        }
        TelemetryBackend::Memory => Arc::new(MemoryStore::default()),
        TelemetryBackend::Off => Arc::new(NullStore),
    }
}

fn off_thread(store: Arc<dyn TelemetryStore>) -> Arc<dyn TelemetryStore> {
    match BackgroundStore::spawn(store.clone()) {
        Ok(bg) => Arc::new(bg),
        Err(e) => {
            tracing::warn!("Failed to start telemetry writer, writing inline: {}", e);
            store
        }
    }
}

fn degraded(backend: &str, path: &Path, err: StoreError) -> Arc<dyn TelemetryStore> {
    tracing::warn!(
        "Failed to open {} telemetry store at {}: {}; telemetry disabled",
        backend,
        path.display(),
        err
    );
    Arc::new(NullStore)
}
