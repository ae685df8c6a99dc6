//! SQLite telemetry backend.
//!
//! One table per record kind. Indexed columns carry what queries filter on;
//! the full record is kept as a JSON `payload` column.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, types::Value as SqlValue, Connection};

use crate::{finish_query, RecordFilter, RecordKind, StoreError, TelemetryRecord, TelemetryStore};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        ensure_telemetry_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn ensure_telemetry_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS slot_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            conversation_id TEXT,
            task_id TEXT,
            slot TEXT NOT NULL,
            source TEXT NOT NULL,
            confidence REAL DEFAULT 0.0,
            payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS execution_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            task_id TEXT,
            tool_id TEXT NOT NULL,
            success BOOLEAN DEFAULT 0,
            duration_ms INTEGER DEFAULT 0,
            attempt INTEGER DEFAULT 1,
            payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS performance_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            stage TEXT NOT NULL,
            duration_ms INTEGER DEFAULT 0,
            payload TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_slot_history_task ON slot_history(task_id);
        CREATE INDEX IF NOT EXISTS idx_execution_log_task ON execution_log(task_id);
        CREATE INDEX IF NOT EXISTS idx_execution_log_ts ON execution_log(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_metrics_stage_ts ON performance_metrics(stage, ts_ms);
        "#,
    )?;
    Ok(())
}

fn table_for(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::SlotResolution => "slot_history",
        RecordKind::Execution => "execution_log",
        RecordKind::Metric => "performance_metrics",
    }
}

fn insert_record(conn: &Connection, record: &TelemetryRecord) -> Result<(), StoreError> {
    let payload = serde_json::to_string(record)?;
    let at = record.recorded_at();
    let ts = at.to_rfc3339();
    let ts_ms = at.timestamp_millis();
    match record {
        TelemetryRecord::SlotResolution(e) => {
            conn.execute(
                "INSERT INTO slot_history (ts, ts_ms, conversation_id, task_id, slot, source,
                 confidence, payload) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    ts,
                    ts_ms,
                    e.conversation_id,
                    e.task_id,
                    e.slot,
                    e.source.as_str(),
                    e.confidence as f64,
                    payload
                ],
            )?;
        }
        TelemetryRecord::Execution(e) => {
            conn.execute(
                "INSERT INTO execution_log (ts, ts_ms, task_id, tool_id, success, duration_ms,
                 attempt, payload) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    ts,
                    ts_ms,
                    e.task_id,
                    e.tool_id,
                    e.success,
                    e.duration_ms as i64,
                    e.attempt,
                    payload
                ],
            )?;
        }
        TelemetryRecord::Metric(m) => {
            conn.execute(
                "INSERT INTO performance_metrics (ts, ts_ms, stage, duration_ms, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts, ts_ms, m.stage.as_str(), m.duration_ms as i64, payload],
            )?;
        }
    }
    Ok(())
}

fn query_table(
    conn: &Connection,
    kind: RecordKind,
    filter: &RecordFilter,
) -> Result<Vec<TelemetryRecord>, StoreError> {
    let mut sql = format!("SELECT payload FROM {} WHERE 1=1", table_for(kind));
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(since) = filter.since {
        sql.push_str(" AND ts_ms >= ?");
        args.push(SqlValue::Integer(since.timestamp_millis()));
    }
    if let Some(until) = filter.until {
        sql.push_str(" AND ts_ms <= ?");
        args.push(SqlValue::Integer(until.timestamp_millis()));
    }
    if let (Some(stage), RecordKind::Metric) = (filter.stage, kind) {
        sql.push_str(" AND stage = ?");
        args.push(SqlValue::Text(stage.as_str().to_string()));
    }
    if let Some(ref task) = filter.task_id {
        if kind != RecordKind::Metric {
            sql.push_str(" AND task_id = ?");
            args.push(SqlValue::Text(task.clone()));
        }
    }
    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for payload in rows {
        let payload = payload?;
        match serde_json::from_str::<TelemetryRecord>(&payload) {
            Ok(rec) => out.push(rec),
            Err(e) => tracing::warn!("Skipping unreadable {} row: {}", table_for(kind), e),
        }
    }
    Ok(out)
}

impl TelemetryStore for SqliteStore {
    fn insert(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        insert_record(&conn, record)
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<TelemetryRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut all = Vec::new();
        for kind in filter.kinds() {
            all.extend(query_table(&conn, kind, filter)?);
        }
        Ok(finish_query(all, filter.limit))
    }
}
