//! Replays a JSON-lines capture of the input topic through the highlights job.
//!
//! Every input line is `{"timestamp_ms": 1700000000000, "key": "id-1", "value": {...}}`;
//! `value` is the record object itself or a string holding its JSON. Window winners are
//! written as JSON lines to `--output` or stdout.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use ht_connectors::{InMemoryBroker, JsonLinesSink, OutboundMessage, SharedSink};
use ht_core::Timestamp;
use ht_runtime::{init_tracing, run_job, JobConfig, JobTimer, MetricsRegistry};
use ht_views::ShutdownPolicy;

#[derive(Parser)]
#[command(name = "highlights_replay")]
#[command(about = "Replay a JSON-lines message capture through the highlights job")]
struct Cli {
    /// JSON-lines file of captured messages
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the window winners (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON job configuration; the flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    window_ms: Option<i64>,

    #[arg(long)]
    slide_ms: Option<i64>,

    #[arg(long)]
    allowed_lateness_ms: Option<i64>,

    #[arg(long)]
    workers: Option<usize>,

    /// Partitions to spread the capture over, by key
    #[arg(long, default_value_t = 1)]
    partitions: u32,

    /// Drop windows still open at the end of the capture
    #[arg(long)]
    discard_open: bool,

    /// Print the job metrics as a JSON line on stderr
    #[arg(long)]
    metrics: bool,
}

#[derive(Deserialize)]
struct Envelope {
    timestamp_ms: Timestamp,
    #[serde(default)]
    key: Option<String>,
    value: serde_json::Value,
}

impl Envelope {
    fn into_message(self, topic: &str) -> Result<OutboundMessage> {
        let value = match self.value {
            serde_json::Value::String(text) => text.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        let mut message = OutboundMessage::new(topic, value).with_timestamp(self.timestamp_ms);
        if let Some(key) = self.key {
            message = message.with_key(key);
        }
        Ok(message)
    }
}

fn job_config(cli: &Cli) -> Result<JobConfig> {
    let mut config = match &cli.config {
        Some(path) => JobConfig::load(path)?,
        None => JobConfig::default(),
    };
    if let Some(window_ms) = cli.window_ms {
        config.window_ms = window_ms;
    }
    if let Some(slide_ms) = cli.slide_ms {
        config.slide_ms = slide_ms;
    }
    if let Some(lateness) = cli.allowed_lateness_ms {
        config.allowed_lateness_ms = lateness;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if cli.discard_open {
        config.shutdown = ShutdownPolicy::DiscardOpen;
    }
    config.validate()?;
    Ok(config)
}

fn load_capture(path: &Path, broker: &InMemoryBroker, topic: &str) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut loaded = 0;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: bad envelope", path.display(), number + 1))?;
        broker.append(envelope.into_message(topic)?)?;
        loaded += 1;
    }
    Ok(loaded)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = job_config(&cli)?;

    let broker = InMemoryBroker::new();
    broker.create_topic(&config.topic, cli.partitions)?;
    let loaded = load_capture(&cli.input, &broker, &config.topic)?;
    info!(loaded, input = %cli.input.display(), "capture loaded");

    let writer: Box<dyn Write + Send> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };
    let sink = SharedSink::new(JsonLinesSink::new(writer));
    let timer = JobTimer::start();
    let snapshot = run_job(&config, Arc::new(broker), sink, MetricsRegistry::default())?;

    if cli.metrics {
        eprintln!("{}", snapshot.to_json_line("highlights_replay", Some(timer.elapsed())));
    }
    Ok(())
}
