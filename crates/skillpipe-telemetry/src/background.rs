//! Writer thread in front of a disk-backed store, so `insert` from inside a
//! turn only enqueues. Queries flush pending writes first.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::{RecordFilter, StoreError, TelemetryRecord, TelemetryStore};

enum Command {
    Insert(TelemetryRecord),
    Flush(mpsc::Sender<()>),
}

pub struct BackgroundStore {
    inner: Arc<dyn TelemetryStore>,
    tx: Option<mpsc::Sender<Command>>,
    writer: Option<JoinHandle<()>>,
}

impl BackgroundStore {
    pub fn spawn(inner: Arc<dyn TelemetryStore>) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::channel::<Command>();
        let target = inner.clone();
        let writer = thread::Builder::new()
            .name("skillpipe-telemetry".to_string())
            .spawn(move || {
                for cmd in rx {
                    match cmd {
                        Command::Insert(record) => {
                            if let Err(e) = target.insert(&record) {
                                tracing::warn!(kind = ?record.kind(), "telemetry write failed: {}", e);
                            }
                        }
                        Command::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })?;
        Ok(Self {
            inner,
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    fn send(&self, cmd: Command) -> Result<(), StoreError> {
        self.tx
            .as_ref()
            .ok_or(StoreError::WriterStopped)?
            .send(cmd)
            .map_err(|_| StoreError::WriterStopped)
    }

    /// Block until every insert queued so far has reached the inner store.
    pub fn flush(&self) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(Command::Flush(ack_tx))?;
        ack_rx.recv().map_err(|_| StoreError::WriterStopped)
    }
}

impl TelemetryStore for BackgroundStore {
    fn insert(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        self.send(Command::Insert(record.clone()))
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<TelemetryRecord>, StoreError> {
        self.flush()?;
        self.inner.query(filter)
    }
}

impl Drop for BackgroundStore {
    fn drop(&mut self) {
        // closing the channel lets the writer drain the queue and exit
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::warn!("telemetry writer thread panicked");
            }
        }
    }
}
