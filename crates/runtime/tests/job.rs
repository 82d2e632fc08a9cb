use std::sync::Arc;

use assert_matches::assert_matches;

use ht_connectors::row::{ARTICLE_TITLE, SENTIMENT_RATIO};
use ht_connectors::{
    BrokerPublisher, InMemoryBroker, MemoryTableSink, OutboundMessage, RetryPolicy, Row,
    SharedSink, SimpleProducer, Sink, SinkError, TableSpec, TransportError,
};
use ht_core::{encode_value, Article, ArticleSentiment, Record, SentimentResponse};
use ht_runtime::{run_job, JobConfig, MetricsRegistry};

const TABLE: &str = "sentimental-news-highlights-table";

fn record(id: &str, timestamp: i64, ratio: f64) -> Record {
    Record::new(
        id,
        timestamp,
        ArticleSentiment {
            article: Article {
                title: format!("title of {id}"),
                ..Article::default()
            },
            sentiment_response: SentimentResponse::new(ratio, 1.0).with_kind("positive"),
        },
    )
}

/// A broker holding `records`, each on the given partition.
fn broker(partitions: u32, records: &[(Record, u32)]) -> Arc<InMemoryBroker> {
    let broker = InMemoryBroker::new();
    broker.create_topic("sentiment-analysis", partitions).unwrap();
    let mut producer = SimpleProducer::new(BrokerPublisher::new(broker.clone()));
    for (record, partition) in records {
        producer
            .send_message(
                OutboundMessage::new("sentiment-analysis", encode_value(record).unwrap())
                    .with_partition(*partition)
                    .with_timestamp(record.timestamp),
            )
            .unwrap();
    }
    producer.close().unwrap();
    Arc::new(broker)
}

fn news(partitions: &[u32; 3]) -> Vec<(Record, u32)> {
    vec![
        (record("r1", 0, 0.9), partitions[0]),
        (record("r2", 5_000, 0.95), partitions[1]),
        (record("r3", 25_000, 0.5), partitions[2]),
    ]
}

fn stored(sink: &SharedSink<MemoryTableSink>) -> (Vec<String>, u64) {
    let guard = sink.lock().unwrap();
    let table = guard.table(TABLE).unwrap();
    (table.rows.keys().cloned().collect(), table.writes)
}

#[test]
fn writes_one_highlight_per_window() {
    let sink = SharedSink::new(MemoryTableSink::new());
    let metrics = MetricsRegistry::default();
    let snapshot = run_job(
        &JobConfig::default(),
        broker(1, &news(&[0, 0, 0])),
        sink.clone(),
        metrics,
    )
    .unwrap();

    // r2 wins the three windows ending at 10s, 20s and 30s; r3 the two after.
    assert_eq!(stored(&sink), (vec!["r2".to_string(), "r3".to_string()], 5));
    assert_eq!(snapshot.messages_read, 3);
    assert_eq!(snapshot.records_decoded, 3);
    assert_eq!(snapshot.sink_writes, 5);
    assert_eq!(snapshot.sink_failures, 0);
    assert_eq!(snapshot.late_records, 0);

    let guard = sink.lock().unwrap();
    let row = &guard.table(TABLE).unwrap().rows["r2"];
    assert_eq!(row.get(ARTICLE_TITLE), Some("title of r2"));
    assert_eq!(row.get(SENTIMENT_RATIO), Some("0.95"));
}

#[test]
fn partitions_and_workers_do_not_change_the_highlights() {
    for workers in [1, 2, 3] {
        let sink = SharedSink::new(MemoryTableSink::new());
        let config = JobConfig {
            workers,
            ..JobConfig::default()
        };
        let snapshot = run_job(
            &config,
            broker(2, &news(&[0, 1, 0])),
            sink.clone(),
            MetricsRegistry::default(),
        )
        .unwrap();
        assert_eq!(stored(&sink), (vec!["r2".to_string(), "r3".to_string()], 5));
        assert_eq!(snapshot.sink_writes, 5);
        assert_eq!(snapshot.late_records, 0);
    }
}

#[test]
fn discarding_open_windows_on_shutdown() {
    let sink = SharedSink::new(MemoryTableSink::new());
    let config = JobConfig {
        shutdown: ht_views::ShutdownPolicy::DiscardOpen,
        ..JobConfig::default()
    };
    let snapshot = run_job(
        &config,
        broker(1, &news(&[0, 0, 0])),
        sink.clone(),
        MetricsRegistry::default(),
    )
    .unwrap();

    // Only the windows ending at 10s and 20s closed before the input ran out.
    assert_eq!(stored(&sink), (vec!["r2".to_string()], 2));
    assert_eq!(snapshot.windows_discarded, 3);
}

#[test]
fn records_behind_the_watermark_are_dropped() {
    let sink = SharedSink::new(MemoryTableSink::new());
    let config = JobConfig {
        fetch_batch: 1,
        ..JobConfig::default()
    };
    let records = vec![
        (record("ahead", 50_000, 0.5), 0),
        (record("behind", 1_000, 0.9), 0),
        (record("after", 55_000, 0.1), 0),
    ];
    let snapshot = run_job(&config, broker(1, &records), sink.clone(), MetricsRegistry::default())
        .unwrap();

    assert_eq!(snapshot.late_records, 1);
    assert_eq!(stored(&sink), (vec!["ahead".to_string()], 3));
}

#[test]
fn undecodable_messages_are_counted_and_skipped() {
    let broker = broker(1, &news(&[0, 0, 0]));
    broker
        .append(OutboundMessage::new("sentiment-analysis", "not json").with_timestamp(6_000))
        .unwrap();
    let sink = SharedSink::new(MemoryTableSink::new());
    let snapshot =
        run_job(&JobConfig::default(), broker, sink.clone(), MetricsRegistry::default()).unwrap();

    assert_eq!(snapshot.messages_read, 4);
    assert_eq!(snapshot.decode_errors, 1);
    assert_eq!(stored(&sink).1, 5);
}

#[test]
fn unknown_topic_fails_the_job() {
    let config = JobConfig {
        topic: "elsewhere".to_string(),
        ..JobConfig::default()
    };
    let error = run_job(
        &config,
        broker(1, &[]),
        SharedSink::new(MemoryTableSink::new()),
        MetricsRegistry::default(),
    )
    .unwrap_err();
    assert_matches!(
        error.downcast_ref::<TransportError>(),
        Some(TransportError::UnknownTopic(_))
    );
}

#[test]
fn invalid_windows_fail_before_reading() {
    let config = JobConfig {
        slide_ms: 0,
        ..JobConfig::default()
    };
    assert!(run_job(
        &config,
        broker(1, &news(&[0, 0, 0])),
        SharedSink::new(MemoryTableSink::new()),
        MetricsRegistry::default(),
    )
    .is_err());
}

struct Refusing;

impl Sink for Refusing {
    fn ensure_table(&mut self, _table: &TableSpec) -> Result<(), SinkError> {
        Ok(())
    }

    fn put(&mut self, _table: &TableSpec, row: &Row) -> Result<(), SinkError> {
        Err(SinkError::Rejected {
            key: row.key.clone(),
            reason: "region offline".to_string(),
        })
    }
}

#[test]
fn sink_failures_are_counted_not_fatal() {
    let config = JobConfig {
        sink_retry: RetryPolicy {
            max_attempts: 2,
            backoff_ms: 0,
        },
        ..JobConfig::default()
    };
    let snapshot = run_job(
        &config,
        broker(1, &news(&[0, 0, 0])),
        SharedSink::new(Refusing),
        MetricsRegistry::default(),
    )
    .unwrap();
    assert_eq!(snapshot.sink_writes, 0);
    assert_eq!(snapshot.winners_dropped, 5);
    assert!(snapshot.sink_failures >= 5);
}

/// Refuses the first `failures` writes, then stores everything.
struct Recovering {
    failures: u32,
    inner: MemoryTableSink,
}

impl Sink for Recovering {
    fn ensure_table(&mut self, table: &TableSpec) -> Result<(), SinkError> {
        self.inner.ensure_table(table)
    }

    fn put(&mut self, table: &TableSpec, row: &Row) -> Result<(), SinkError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SinkError::Unavailable);
        }
        self.inner.put(table, row)
    }
}

fn single_attempt() -> JobConfig {
    JobConfig {
        sink_retry: RetryPolicy {
            max_attempts: 1,
            backoff_ms: 0,
        },
        ..JobConfig::default()
    }
}

#[test]
fn refused_highlights_are_written_later() {
    let sink = SharedSink::new(Recovering {
        failures: 2,
        inner: MemoryTableSink::new(),
    });
    let snapshot = run_job(
        &single_attempt(),
        broker(1, &news(&[0, 0, 0])),
        sink.clone(),
        MetricsRegistry::default(),
    )
    .unwrap();

    let guard = sink.lock().unwrap();
    let table = guard.inner.table(TABLE).unwrap();
    assert_eq!(table.writes, 5);
    assert_eq!(table.rows.len(), 2);
    assert_eq!(snapshot.sink_writes, 5);
    assert_eq!(snapshot.sink_redeliveries, 1);
    assert_eq!(snapshot.sink_failures, 2);
    assert_eq!(snapshot.winners_dropped, 0);
}

#[test]
fn redelivery_is_bounded_by_retention() {
    let config = JobConfig {
        emitted_retention: 1,
        ..single_attempt()
    };
    let sink = SharedSink::new(Recovering {
        failures: 3,
        inner: MemoryTableSink::new(),
    });
    let snapshot = run_job(
        &config,
        broker(1, &news(&[0, 0, 0])),
        sink.clone(),
        MetricsRegistry::default(),
    )
    .unwrap();

    // The first winner is refused twice and then evicted by the second, which gets in
    // on redelivery once the sink recovers.
    assert_eq!(snapshot.winners_dropped, 1);
    assert_eq!(snapshot.sink_writes, 4);
    assert_eq!(sink.lock().unwrap().inner.table(TABLE).unwrap().writes, 4);
}

#[test]
fn emitting_every_window_discards_none() {
    let records: Vec<(Record, u32)> = (0..20)
        .map(|i| (record(&format!("n{i}"), i * 10_000, 0.1 * (i % 7) as f64), 0))
        .collect();
    let snapshot = run_job(
        &JobConfig::default(),
        broker(1, &records),
        SharedSink::new(MemoryTableSink::new()),
        MetricsRegistry::default(),
    )
    .unwrap();

    // Twenty records ten seconds apart touch 22 windows of 30s.
    assert_eq!(snapshot.sink_writes, 22);
    assert_eq!(snapshot.partials_emitted, 22);
    assert_eq!(snapshot.windows_discarded, 0);
    assert_eq!(snapshot.results_released, 22 - 8);
}
