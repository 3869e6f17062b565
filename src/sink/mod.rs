//! Time-series storage contract.
//!
//! A sink receives [`MeasurementRecord`]s: a table name, a timestamp and named
//! scalar fields. Every recorder holds a shared handle to the same sink, so
//! implementations must accept concurrent writes.

pub mod csv;
pub mod memory;

use crate::error::SinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One decoded measurement, produced and consumed within a single poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub table: String,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

impl MeasurementRecord {
    pub fn new(table: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            table: table.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Write contract of the time-series store.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Confirm the store is reachable. Called once before any recorder starts.
    async fn ping(&self) -> Result<(), SinkError>;

    /// Persist one record. Either the whole record is stored or none of it.
    async fn write(&self, record: &MeasurementRecord) -> Result<(), SinkError>;

    /// Flush buffered output.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Storage backends selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Csv,
    Memory,
}

/// Build the sink for a configured backend.
pub fn sink_for(backend: StorageBackend, output_dir: PathBuf) -> Arc<dyn TimeSeriesSink> {
    match backend {
        StorageBackend::Csv => Arc::new(csv::CsvSink::new(output_dir)),
        StorageBackend::Memory => Arc::new(memory::MemorySink::new()),
    }
}
