//! JSONL telemetry backend: one append-only file per record kind.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{finish_query, RecordFilter, RecordKind, StoreError, TelemetryRecord, TelemetryStore};

pub struct JsonlStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, kind: RecordKind) -> PathBuf {
        let name = match kind {
            RecordKind::SlotResolution => "slot_history.jsonl",
            RecordKind::Execution => "execution_log.jsonl",
            RecordKind::Metric => "performance_metrics.jsonl",
        };
        self.dir.join(name)
    }

    fn read_kind(&self, kind: RecordKind) -> Result<Vec<TelemetryRecord>, StoreError> {
        let path = self.path_for(kind);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(&path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetryRecord>(line) {
                Ok(rec) => out.push(rec),
                // A torn trailing line from a crashed writer must not hide the rest.
                Err(e) => tracing::warn!("Skipping malformed line in {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }
}

impl TelemetryStore for JsonlStore {
    fn insert(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let path = self.path_for(record.kind());
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<TelemetryRecord>, StoreError> {
        let mut all = Vec::new();
        for kind in filter.kinds() {
            all.extend(self.read_kind(kind)?.into_iter().filter(|r| filter.matches(r)));
        }
        Ok(finish_query(all, filter.limit))
    }
}
