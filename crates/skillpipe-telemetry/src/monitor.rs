//! Stage performance monitor.
//!
//! `record` is fire-and-forget. Aggregates are computed on read from the raw
//! metric rows; nothing is maintained incrementally.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use skillpipe_core::records::{PerformanceMetric, Stage};

use crate::{record_best_effort, RecordFilter, StoreError, TelemetryRecord, TelemetryStore};

/// Time window for aggregation queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeWindow {
    All,
    /// Records from the last `Duration` up to now.
    Last(Duration),
    Between(DateTime<Utc>, DateTime<Utc>),
}

impl TimeWindow {
    fn bounds(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match *self {
            TimeWindow::All => (None, None),
            TimeWindow::Last(d) => (Some(Utc::now() - d), None),
            TimeWindow::Between(from, to) => (Some(from), Some(to)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl StageSummary {
    /// Aggregate raw durations. Percentiles use the nearest-rank method.
    pub fn from_durations(stage: Stage, durations: &[u64]) -> Self {
        if durations.is_empty() {
            return Self {
                stage,
                count: 0,
                avg_ms: 0.0,
                p50_ms: 0,
                p95_ms: 0,
                min_ms: 0,
                max_ms: 0,
            };
        }
        let mut sorted = durations.to_vec();
        sorted.sort_unstable();
        let n = sorted.len();
        let total: u128 = sorted.iter().map(|d| *d as u128).sum();
        Self {
            stage,
            count: n,
            avg_ms: total as f64 / n as f64,
            p50_ms: nearest_rank(&sorted, 0.50),
            p95_ms: nearest_rank(&sorted, 0.95),
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
        }
    }
}

fn nearest_rank(sorted: &[u64], q: f64) -> u64 {
    let n = sorted.len();
    let rank = (q * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

pub struct PerformanceMonitor {
    store: Arc<dyn TelemetryStore>,
}

impl PerformanceMonitor {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    /// Append one metric. Never fails.
    pub fn record(&self, stage: Stage, duration_ms: u64, metadata: Value) {
        let metric = PerformanceMetric::new(stage, duration_ms, metadata);
        tracing::trace!(stage = %stage, duration_ms, "stage metric");
        record_best_effort(self.store.as_ref(), &TelemetryRecord::Metric(metric));
    }

    /// Start timing a stage; the metric is recorded when the timer is
    /// finished or dropped.
    pub fn start(&self, stage: Stage) -> StageTimer<'_> {
        StageTimer {
            monitor: self,
            stage,
            started: Instant::now(),
            metadata: Map::new(),
            done: false,
        }
    }

    pub fn query(&self, stage: Stage, window: TimeWindow) -> Result<StageSummary, StoreError> {
        let (since, until) = window.bounds();
        let filter = RecordFilter {
            since,
            until,
            ..RecordFilter::stage(stage)
        };
        let durations: Vec<u64> = self
            .store
            .query(&filter)?
            .into_iter()
            .filter_map(|r| match r {
                TelemetryRecord::Metric(m) => Some(m.duration_ms),
                _ => None,
            })
            .collect();
        Ok(StageSummary::from_durations(stage, &durations))
    }

    /// Summaries for every stage, in pipeline order.
    pub fn query_all(&self, window: TimeWindow) -> Result<Vec<StageSummary>, StoreError> {
        Stage::ALL.iter().map(|s| self.query(*s, window)).collect()
    }
}

pub struct StageTimer<'a> {
    monitor: &'a PerformanceMonitor,
    stage: Stage,
    started: Instant,
    metadata: Map<String, Value>,
    done: bool,
}

impl StageTimer<'_> {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Record now and return the elapsed milliseconds.
    pub fn finish(mut self) -> u64 {
        self.flush()
    }

    fn flush(&mut self) -> u64 {
        let elapsed = self.started.elapsed().as_millis() as u64;
        if !self.done {
            self.done = true;
            let metadata = Value::Object(std::mem::take(&mut self.metadata));
            self.monitor.record(self.stage, elapsed, metadata);
        }
        elapsed
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
