//! Job configuration, loaded from an optional JSON file and overridden from the
//! command line.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use ht_connectors::{RetryPolicy, TableSpec};
use ht_ranking::{SentimentOrder, SentimentRule};
use ht_views::{ShutdownPolicy, SlidingWindows, WindowSpec, DEFAULT_RETENTION};

pub const DEFAULT_TOPIC: &str = "sentiment-analysis";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub topic: String,
    pub window_ms: i64,
    pub slide_ms: i64,
    /// How far behind the newest record of a partition the watermark trails.
    pub allowed_lateness_ms: i64,
    pub shutdown: ShutdownPolicy,
    /// Results kept for redelivery: emitted partials per aggregator, and winners the
    /// sink refused per worker.
    pub emitted_retention: usize,
    pub workers: usize,
    /// Messages fetched from one partition per read.
    pub fetch_batch: usize,
    pub ranking: SentimentOrder,
    pub table: TableSpec,
    pub sink_retry: RetryPolicy,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            window_ms: 30_000,
            slide_ms: 10_000,
            allowed_lateness_ms: 0,
            shutdown: ShutdownPolicy::EmitOpen,
            emitted_retention: DEFAULT_RETENTION,
            workers: 1,
            fetch_batch: 256,
            ranking: SentimentOrder::RatioThenScore,
            table: TableSpec::default(),
            sink_retry: RetryPolicy::default(),
        }
    }
}

impl JobConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.windows()?;
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.fetch_batch == 0 {
            bail!("fetch_batch must be at least 1");
        }
        if self.allowed_lateness_ms < 0 {
            bail!("allowed_lateness_ms must not be negative");
        }
        if self.topic.is_empty() {
            bail!("topic must not be empty");
        }
        if self.table.name.is_empty() || self.table.family.is_empty() {
            bail!("table name and column family must not be empty");
        }
        Ok(())
    }

    pub fn windows(&self) -> Result<SlidingWindows> {
        SlidingWindows::new(self.window_ms, self.slide_ms).context("invalid window configuration")
    }

    pub fn window_spec(&self) -> Result<WindowSpec> {
        Ok(WindowSpec {
            windows: self.windows()?,
            shutdown: self.shutdown,
            retention: self.emitted_retention,
        })
    }

    pub fn rule(&self) -> SentimentRule {
        SentimentRule {
            order: self.ranking,
        }
    }
}
