//! Persistent storage for readings and history.
//!
//! Layout under the data directory:
//!
//! ```text
//! readings/2025/03/10.jsonl   every accepted reading of that UTC day, one per line
//! history.json                snapshot of the retention history
//! ```
//!
//! The pipeline hands readings to a [`ReadingSink`] and never waits on it;
//! [`StorageSink`] appends them from a dedicated blocking writer.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::retention::HistorySnapshot;
use crate::types::Reading;

const HISTORY_FILE: &str = "history.json";

/// Errors raised by [`Storage`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// A file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A file held invalid JSON.
    #[error("Failed to parse {path}: {source}")]
    ParseError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be serialized.
    #[error("Failed to serialize: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// A directory could not be created.
    #[error("Failed to create directory {path}: {source}")]
    CreateDirError {
        /// Directory path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Default data directory.
///
/// On the Raspberry Pi: `/var/lib/gasmask/`
/// Elsewhere: the platform data directory (e.g. `~/.local/share/gasmask/`).
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/gasmask")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "gasmask").map_or_else(
            || PathBuf::from("gasmask-data"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }
}

/// File-backed storage rooted at a data directory.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Creates storage rooted at `data_dir`. Nothing is created until the
    /// first write.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Appends one reading to its day file.
    ///
    /// # Errors
    ///
    /// Returns an error if the reading cannot be serialized or written.
    pub fn append_reading(&self, reading: &Reading) -> StorageResult<()> {
        let date = reading
            .timestamp_utc()
            .map_or_else(NaiveDate::default, |utc| utc.date_naive());
        let path = self.day_path(date);
        ensure_parent(&path)?;

        let mut line = serde_json::to_string(reading)?;
        line.push('\n');

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|source| StorageError::WriteError {
                path: path.display().to_string(),
                source,
            })
    }

    /// Loads every reading stored for a UTC day, oldest first.
    ///
    /// A missing day is empty. Lines that do not parse (such as a line cut
    /// short by a power loss) are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load_day(&self, date: NaiveDate) -> StorageResult<Vec<Reading>> {
        let path = self.day_path(date);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::ReadError {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let mut readings = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Reading>(line) {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    warn!(path = %path.display(), line = index + 1, error = %e, "Skipping bad line");
                }
            }
        }
        Ok(readings)
    }

    /// Saves the retention history snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn save_history(&self, snapshot: &HistorySnapshot) -> StorageResult<()> {
        let path = self.data_dir.join(HISTORY_FILE);
        ensure_parent(&path)?;
        let content = serde_json::to_string_pretty(snapshot)?;

        // Write then rename, so a crash never leaves a truncated snapshot.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|source| StorageError::WriteError {
                path: path.display().to_string(),
                source,
            })?;
        debug!(path = %path.display(), entries = snapshot.entries.len(), "History saved");
        Ok(())
    }

    /// Loads the retention history snapshot, if one was saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_history(&self) -> StorageResult<Option<HistorySnapshot>> {
        let path = self.data_dir.join(HISTORY_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::ReadError {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StorageError::ParseError {
                path: path.display().to_string(),
                source,
            })
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join("readings")
            .join(format!("{}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}.jsonl", date.day()))
    }
}

fn ensure_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirError {
            path: parent.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

// ============================================================================
// Sink
// ============================================================================

/// Destination for finalized readings. Calls must not block.
pub trait ReadingSink: Send + Sync {
    /// Hands a reading over for durable storage.
    fn record(&self, reading: &Reading);
}

/// Sink that appends readings to [`Storage`] from a blocking writer.
///
/// Readings are written in the order they were recorded. Failures are
/// logged and the reading is dropped.
#[derive(Debug, Clone)]
pub struct StorageSink {
    tx: mpsc::UnboundedSender<Reading>,
}

impl StorageSink {
    /// Starts the writer. It stops once every sink clone is dropped.
    #[must_use]
    pub fn spawn(storage: Arc<Storage>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Reading>();
        let writer = tokio::task::spawn_blocking(move || {
            while let Some(reading) = rx.blocking_recv() {
                if let Err(e) = storage.append_reading(&reading) {
                    warn!(device_id = %reading.device_id, error = %e, "Failed to persist reading");
                }
            }
        });
        (Self { tx }, writer)
    }
}

impl ReadingSink for StorageSink {
    fn record(&self, reading: &Reading) {
        if self.tx.send(reading.clone()).is_err() {
            warn!("Storage writer stopped; reading not persisted");
        }
    }
}
