use std::sync::Mutex;

use crate::{finish_query, RecordFilter, StoreError, TelemetryRecord, TelemetryStore};

/// In-process store. Used by tests and `SKILLPIPE_TELEMETRY=memory`.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetryStore for MemoryStore {
    fn insert(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(record.clone());
        Ok(())
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<TelemetryRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let matched = records.iter().filter(|r| filter.matches(r)).cloned().collect();
        Ok(finish_query(matched, filter.limit))
    }
}

/// Discards everything.
pub struct NullStore;

impl TelemetryStore for NullStore {
    fn insert(&self, _record: &TelemetryRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn query(&self, _filter: &RecordFilter) -> Result<Vec<TelemetryRecord>, StoreError> {
        Ok(Vec::new())
    }
}
