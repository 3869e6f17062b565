//! CSV storage backend with clean feature flag handling.
//!
//! Each table is written to `<output_dir>/<table>.csv`. The header is
//! `timestamp` followed by the field names in sorted order; appending to an
//! existing file reuses its header, and a record whose fields differ from the
//! header is rejected.

use super::{MeasurementRecord, TimeSeriesSink};
use crate::error::SinkError;
use async_trait::async_trait;
use std::path::PathBuf;

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::collections::HashMap;
    use std::fs::{File, OpenOptions};
    use std::path::Path;
    use tokio::sync::Mutex;
    use tracing::{debug, info};

    struct TableWriter {
        columns: Vec<String>,
        writer: ::csv::Writer<File>,
    }

    pub struct CsvSink {
        output_dir: PathBuf,
        tables: Mutex<HashMap<String, TableWriter>>,
    }

    impl CsvSink {
        pub fn new(output_dir: impl Into<PathBuf>) -> Self {
            Self {
                output_dir: output_dir.into(),
                tables: Mutex::new(HashMap::new()),
            }
        }

        pub fn table_path(&self, table: &str) -> PathBuf {
            self.output_dir.join(format!("{}.csv", table))
        }

        fn open_table(&self, record: &MeasurementRecord) -> Result<TableWriter, SinkError> {
            let table = &record.table;
            if table.is_empty() || table.contains(['/', '\\']) || table.starts_with('.') {
                return Err(SinkError::Write {
                    table: table.clone(),
                    reason: "table name is not a valid file name".to_string(),
                });
            }

            std::fs::create_dir_all(&self.output_dir)?;
            let path = self.table_path(table);
            let existing = existing_header(&path)?;

            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = ::csv::Writer::from_writer(file);

            let columns = match existing {
                Some(columns) => columns,
                None => {
                    let columns: Vec<String> = record.fields.keys().cloned().collect();
                    let mut header = vec!["timestamp".to_string()];
                    header.extend(columns.iter().cloned());
                    writer.write_record(&header).map_err(csv_error)?;
                    columns
                }
            };

            info!(table = %table, path = %path.display(), "CSV table opened");
            Ok(TableWriter { columns, writer })
        }
    }

    /// Field columns of an existing non-empty file, without `timestamp`.
    fn existing_header(path: &Path) -> Result<Option<Vec<String>>, SinkError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => {
                let mut reader = ::csv::Reader::from_path(path).map_err(csv_error)?;
                let headers = reader.headers().map_err(csv_error)?;
                Ok(Some(headers.iter().skip(1).map(str::to_string).collect()))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn csv_error(err: ::csv::Error) -> SinkError {
        SinkError::Csv(err.to_string())
    }

    #[async_trait]
    impl TimeSeriesSink for CsvSink {
        async fn ping(&self) -> Result<(), SinkError> {
            std::fs::create_dir_all(&self.output_dir).map_err(|e| {
                SinkError::Unreachable(format!("{}: {}", self.output_dir.display(), e))
            })?;
            let meta = std::fs::metadata(&self.output_dir).map_err(|e| {
                SinkError::Unreachable(format!("{}: {}", self.output_dir.display(), e))
            })?;
            if meta.permissions().readonly() {
                return Err(SinkError::Unreachable(format!(
                    "{} is read-only",
                    self.output_dir.display()
                )));
            }
            Ok(())
        }

        async fn write(&self, record: &MeasurementRecord) -> Result<(), SinkError> {
            let mut tables = self.tables.lock().await;
            if !tables.contains_key(&record.table) {
                let table = self.open_table(record)?;
                tables.insert(record.table.clone(), table);
            }
            let table = tables.get_mut(&record.table).ok_or_else(|| SinkError::Write {
                table: record.table.clone(),
                reason: "table writer missing".to_string(),
            })?;

            let mut row = Vec::with_capacity(table.columns.len() + 1);
            row.push(record.timestamp.to_rfc3339());
            for column in &table.columns {
                let value = record.fields.get(column).ok_or_else(|| SinkError::Write {
                    table: record.table.clone(),
                    reason: format!("record has no value for column '{}'", column),
                })?;
                row.push(value.to_string());
            }
            if record.fields.len() != table.columns.len() {
                return Err(SinkError::Write {
                    table: record.table.clone(),
                    reason: format!(
                        "record has {} field(s), table has {} column(s)",
                        record.fields.len(),
                        table.columns.len()
                    ),
                });
            }

            table.writer.write_record(&row).map_err(csv_error)?;
            table.writer.flush()?;
            debug!(table = %record.table, "CSV row written");
            Ok(())
        }

        async fn flush(&self) -> Result<(), SinkError> {
            let mut tables = self.tables.lock().await;
            for table in tables.values_mut() {
                table.writer.flush()?;
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    pub struct CsvSink {
        output_dir: PathBuf,
    }

    impl CsvSink {
        pub fn new(output_dir: impl Into<PathBuf>) -> Self {
            Self {
                output_dir: output_dir.into(),
            }
        }

        pub fn table_path(&self, table: &str) -> PathBuf {
            self.output_dir.join(format!("{}.csv", table))
        }
    }

    #[async_trait]
    impl TimeSeriesSink for CsvSink {
        async fn ping(&self) -> Result<(), SinkError> {
            Err(SinkError::Unreachable(
                "CSV storage requires the storage_csv feature".to_string(),
            ))
        }

        async fn write(&self, record: &MeasurementRecord) -> Result<(), SinkError> {
            Err(SinkError::Write {
                table: record.table.clone(),
                reason: "CSV storage requires the storage_csv feature".to_string(),
            })
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvSink;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvSink;
