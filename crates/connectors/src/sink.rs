//! Destinations for window winners.
//!
//! The store itself is a collaborator; what lives here is the trait the job writes
//! through plus an in-memory table store, a JSON-lines writer and a retry wrapper.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::row::Row;

pub const DEFAULT_TABLE: &str = "sentimental-news-highlights-table";
pub const DEFAULT_FAMILY: &str = "sentimental-news-highlights-cf";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TableSpec {
    pub name: String,
    pub family: String,
}

impl Default for TableSpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_TABLE.to_string(),
            family: DEFAULT_FAMILY.to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("row {key} rejected: {reason}")]
    Rejected { key: String, reason: String },
    #[error("sink is unavailable")]
    Unavailable,
}

impl SinkError {
    /// Whether retrying the same write can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Io(_) | SinkError::Rejected { .. } | SinkError::Unavailable)
    }
}

/// A column-family store. Writing the same row twice must be harmless.
pub trait Sink: Send {
    /// Create `table` with its column family unless it already exists.
    fn ensure_table(&mut self, table: &TableSpec) -> Result<(), SinkError>;

    fn put(&mut self, table: &TableSpec, row: &Row) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub family: String,
    pub rows: BTreeMap<String, Row>,
    pub writes: u64,
}

/// In-process table store keyed by row key.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableSink {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryTableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.get(name)
    }

    pub fn rows(&self, name: &str) -> Vec<&Row> {
        self.tables
            .get(name)
            .map(|table| table.rows.values().collect())
            .unwrap_or_default()
    }
}

impl Sink for MemoryTableSink {
    fn ensure_table(&mut self, table: &TableSpec) -> Result<(), SinkError> {
        if !self.tables.contains_key(&table.name) {
            info!(table = %table.name, family = %table.family, "creating table");
            self.tables.insert(
                table.name.clone(),
                MemoryTable {
                    family: table.family.clone(),
                    ..MemoryTable::default()
                },
            );
        }
        Ok(())
    }

    fn put(&mut self, table: &TableSpec, row: &Row) -> Result<(), SinkError> {
        let stored = self
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| SinkError::MissingTable(table.name.clone()))?;
        stored.rows.insert(row.key.clone(), row.clone());
        stored.writes += 1;
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRow<'a> {
    table: &'a str,
    family: &'a str,
    key: &'a str,
    columns: &'a BTreeMap<String, String>,
}

/// Writes one JSON object per row.
pub struct JsonLinesSink<W> {
    writer: W,
    tables: BTreeSet<String>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            tables: BTreeSet::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn ensure_table(&mut self, table: &TableSpec) -> Result<(), SinkError> {
        self.tables.insert(table.name.clone());
        Ok(())
    }

    fn put(&mut self, table: &TableSpec, row: &Row) -> Result<(), SinkError> {
        if !self.tables.contains(&table.name) {
            return Err(SinkError::MissingTable(table.name.clone()));
        }
        let line = JsonRow {
            table: &table.name,
            family: &table.family,
            key: &row.key,
            columns: &row.columns,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// One sink written to from several workers.
pub struct SharedSink<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Sink> SharedSink<S> {
    pub fn new(sink: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, S>, SinkError> {
        self.inner.lock().map_err(|_| SinkError::Unavailable)
    }
}

impl<S: Sink> Sink for SharedSink<S> {
    fn ensure_table(&mut self, table: &TableSpec) -> Result<(), SinkError> {
        self.lock()?.ensure_table(table)
    }

    fn put(&mut self, table: &TableSpec, row: &Row) -> Result<(), SinkError> {
        self.lock()?.put(table, row)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.lock()?.flush()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

/// Retries transient write failures with a fixed backoff.
pub struct RetryingSink<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Sink> RetryingSink<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Sink> Sink for RetryingSink<S> {
    fn ensure_table(&mut self, table: &TableSpec) -> Result<(), SinkError> {
        self.inner.ensure_table(table)
    }

    fn put(&mut self, table: &TableSpec, row: &Row) -> Result<(), SinkError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.put(table, row) {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() && attempt < attempts => {
                    warn!(%error, attempt, key = %row.key, "row write failed, retrying");
                    thread::sleep(Duration::from_millis(self.policy.backoff_ms));
                    attempt += 1;
                }
                Err(error) => {
                    debug!(%error, attempt, key = %row.key, "giving up on row");
                    return Err(error);
                }
            }
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.inner.flush()
    }
}
