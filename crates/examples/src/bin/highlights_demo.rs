//! Publishes a synthetic stream of scored news through the producer into an in-memory
//! broker, runs the highlights job over it and prints the table it wrote.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use ht_connectors::row::{ARTICLE_SOURCE, ARTICLE_TITLE, SENTIMENT_RATIO, SENTIMENT_SCORE};
use ht_connectors::{
    BrokerPublisher, InMemoryBroker, MemoryTableSink, OutboundMessage, SharedSink,
    SimpleProducer,
};
use ht_core::{encode_value, Article, ArticleSentiment, Record, SentimentResponse};
use ht_runtime::{init_tracing, run_job, JobConfig, JobTimer, MetricsRegistry};
use ht_views::ShutdownPolicy;

const SOURCES: &[&str] = &["wire", "markets-daily", "tech-post", "city-herald", "the-ledger"];
const KEYWORDS: &[&str] = &["rates", "earnings", "chips", "energy", "housing", "jobs"];

#[derive(Parser)]
#[command(name = "highlights_demo")]
#[command(about = "Run the sentiment highlights job over synthetic news")]
struct Cli {
    /// Number of synthetic articles to publish
    #[arg(long, default_value_t = 40)]
    records: u64,

    /// Event-time gap between consecutive articles, in milliseconds
    #[arg(long, default_value_t = 1_500)]
    spacing_ms: i64,

    /// Partitions of the demo topic
    #[arg(long, default_value_t = 2)]
    partitions: u32,

    /// Timely worker threads (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,

    /// Drop windows still open when the stream ends instead of emitting them
    #[arg(long)]
    discard_open: bool,

    /// JSON job configuration
    #[arg(long)]
    config: Option<PathBuf>,
}

fn synthetic(index: u64, spacing_ms: i64) -> Record {
    let ratio = ((index * 37) % 100) as f64 / 100.0;
    let score = ((index * 11) % 7) as f64 - 3.0;
    let kind = if ratio >= 0.5 { "positive" } else { "negative" };
    let source = SOURCES[(index % SOURCES.len() as u64) as usize];
    let keywords = [
        KEYWORDS[(index % KEYWORDS.len() as u64) as usize],
        KEYWORDS[((index * 5 + 1) % KEYWORDS.len() as u64) as usize],
    ];

    Record::new(
        format!("news-{index}"),
        index as i64 * spacing_ms,
        ArticleSentiment {
            article: Article {
                title: format!("Story {index} from {source}"),
                description: format!("Synthetic article number {index}"),
                url: format!("https://news.example/{source}/{index}"),
                source: source.to_string(),
                country: "us".to_string(),
                language: "english".to_string(),
                authors: vec![format!("reporter-{}", index % 4)],
                ..Article::default()
            },
            sentiment_response: SentimentResponse::new(ratio, score)
                .with_kind(kind)
                .with_keywords(keywords),
        },
    )
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => JobConfig::load(path)?,
        None => JobConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if cli.discard_open {
        config.shutdown = ShutdownPolicy::DiscardOpen;
    }
    info!(records = cli.records, partitions = cli.partitions, "highlights_demo starting");

    let broker = InMemoryBroker::new();
    broker.create_topic(&config.topic, cli.partitions)?;
    let mut producer = SimpleProducer::new(BrokerPublisher::new(broker.clone()));
    for index in 0..cli.records {
        let record = synthetic(index, cli.spacing_ms);
        let message = OutboundMessage::new(config.topic.as_str(), encode_value(&record)?)
            .with_key(record.id.as_str())
            .with_timestamp(record.timestamp);
        producer.send_message(message)?;
    }
    producer.flush()?;
    producer.close()?;

    let sink = SharedSink::new(MemoryTableSink::new());
    let metrics = MetricsRegistry::default();
    let timer = JobTimer::start();
    let snapshot = run_job(&config, Arc::new(broker), sink.clone(), metrics)?;

    let stored = sink.lock()?;
    for row in stored.rows(&config.table.name) {
        println!(
            "{:<10} ratio={:<5} score={:<5} {:<14} {}",
            row.key,
            row.get(SENTIMENT_RATIO).unwrap_or_default(),
            row.get(SENTIMENT_SCORE).unwrap_or_default(),
            row.get(ARTICLE_SOURCE).unwrap_or_default(),
            row.get(ARTICLE_TITLE).unwrap_or_default(),
        );
    }
    println!("{}", snapshot.to_json_line("highlights_demo", Some(timer.elapsed())));
    Ok(())
}
