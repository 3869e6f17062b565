//! Sink that keeps records in memory.

use super::{MeasurementRecord, TimeSeriesSink};
use crate::error::SinkError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Stores every record in arrival order. Reachability and write failures can
/// be switched on to exercise the error paths of callers.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<MeasurementRecord>>,
    unreachable: AtomicBool,
    reject_writes: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<MeasurementRecord> {
        self.records.lock().await.clone()
    }

    /// Records written to `table`, in arrival order.
    pub async fn records_for(&self, table: &str) -> Vec<MeasurementRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn ping(&self) -> Result<(), SinkError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SinkError::Unreachable("memory sink offline".to_string()));
        }
        Ok(())
    }

    async fn write(&self, record: &MeasurementRecord) -> Result<(), SinkError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SinkError::Unreachable("memory sink offline".to_string()));
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(SinkError::Write {
                table: record.table.clone(),
                reason: "write rejected".to_string(),
            });
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
