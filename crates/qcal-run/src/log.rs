use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use qcal_core::errors::{CalError, ErrorInfo};
use qcal_core::{LogLevel, LogRecord, Logger};

fn io_error(code: &str, path: &Path, err: impl ToString) -> CalError {
    CalError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// Forwards records to `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn record(&self, record: &LogRecord) {
        let payload = record.payload.to_string();
        match record.level {
            LogLevel::Debug => {
                tracing::debug!(label = %record.label, payload = %payload, "{}", record.message)
            }
            LogLevel::Info => {
                tracing::info!(label = %record.label, payload = %payload, "{}", record.message)
            }
            LogLevel::Warn => {
                tracing::warn!(label = %record.label, payload = %payload, "{}", record.message)
            }
            LogLevel::Error => {
                tracing::error!(label = %record.label, payload = %payload, "{}", record.message)
            }
        }
    }
}

/// Appends one JSON document per record to `<dir>/<timestamp>.jsonl`.
///
/// Write failures are reported through `tracing` and otherwise ignored.
#[derive(Debug)]
pub struct JsonLinesLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesLogger {
    /// Creates the log directory and opens a fresh log file in it.
    pub fn create(dir: &Path) -> Result<Self, CalError> {
        fs::create_dir_all(dir).map_err(|err| io_error("qcal.log.create_dir", dir, err))?;
        let path = dir.join(format!("{}.jsonl", Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f")));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_error("qcal.log.open", &path, err))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Logger for JsonLinesLogger {
    fn record(&self, record: &LogRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode log record");
                return;
            }
        };
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(err) = writeln!(file, "{line}") {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to append log record");
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl Logger for MemoryLogger {
    fn record(&self, record: &LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Fans records out to several loggers.
#[derive(Default)]
pub struct TeeLogger<'a> {
    loggers: Vec<&'a dyn Logger>,
}

impl<'a> TeeLogger<'a> {
    /// Creates a logger with no targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target.
    pub fn with(mut self, logger: &'a dyn Logger) -> Self {
        self.loggers.push(logger);
        self
    }
}

impl Logger for TeeLogger<'_> {
    fn record(&self, record: &LogRecord) {
        for logger in &self.loggers {
            logger.record(record);
        }
    }
}
