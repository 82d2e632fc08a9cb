//! The highlights job: read the topic, keep the most extreme record of every sliding
//! window, and write each window's winner to the table.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use timely::dataflow::operators::probe::Handle as ProbeHandle;
use timely::dataflow::operators::{Input, Inspect, Probe};
use tracing::{error, info, warn};

use ht_connectors::{MessageSource, RetryingSink, Row, SharedSink, Sink};
use ht_core::{PartitionId, Record};
use ht_views::{
    decode_records, epoch_of, merge_partials, window_extremum, BoundedOutOfOrderness,
    WindowResult,
};

use crate::config::JobConfig;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::start_runtime;

/// Read position and watermark of one partition owned by a worker.
struct PartitionCursor {
    partition: PartitionId,
    offset: u64,
    exhausted: bool,
    watermark: BoundedOutOfOrderness,
}

/// Writes window winners through the shared sink and counts the outcome.
///
/// A winner the sink refuses is kept, up to `emitted_retention` of them, and offered
/// again before the next write and once more when the worker shuts down.
struct WinnerWriter<S: Sink> {
    sink: RetryingSink<SharedSink<S>>,
    config: Arc<JobConfig>,
    metrics: MetricsRegistry,
    undelivered: VecDeque<WindowResult<Record>>,
}

impl<S: Sink> WinnerWriter<S> {
    fn new(sink: SharedSink<S>, config: Arc<JobConfig>, metrics: MetricsRegistry) -> Self {
        Self {
            sink: RetryingSink::new(sink, config.sink_retry),
            config,
            metrics,
            undelivered: VecDeque::new(),
        }
    }

    fn write(&mut self, result: &WindowResult<Record>) {
        self.redeliver();
        if !self.deliver(result) {
            self.hold(result.clone());
        }
    }

    /// Offer every held winner again; the ones that still fail stay held.
    fn redeliver(&mut self) {
        if self.undelivered.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.undelivered);
        for result in held {
            if self.deliver(&result) {
                self.metrics.inc_sink_redeliveries(1);
            } else {
                self.undelivered.push_back(result);
            }
        }
    }

    /// Last attempt at shutdown; whatever is still held is lost.
    fn finish(&mut self) {
        self.redeliver();
        for result in self.undelivered.drain(..) {
            self.metrics.inc_winners_dropped(1);
            error!(
                window_start = result.window.start,
                key = %result.record.id,
                "window highlight never reached the sink"
            );
        }
    }

    fn hold(&mut self, result: WindowResult<Record>) {
        let retention = self.config.emitted_retention;
        if retention == 0 {
            self.metrics.inc_winners_dropped(1);
            return;
        }
        while self.undelivered.len() >= retention {
            if let Some(evicted) = self.undelivered.pop_front() {
                self.metrics.inc_winners_dropped(1);
                warn!(
                    window_start = evicted.window.start,
                    key = %evicted.record.id,
                    retention,
                    "dropping undelivered window highlight"
                );
            }
        }
        self.undelivered.push_back(result);
    }

    fn deliver(&mut self, result: &WindowResult<Record>) -> bool {
        let row = Row::from_record(&result.record);
        match self.sink.put(&self.config.table, &row) {
            Ok(()) => {
                self.metrics.inc_sink_writes(1);
                info!(
                    window_start = result.window.start,
                    window_end = result.window.end,
                    key = %row.key,
                    members = result.members,
                    "wrote window highlight"
                );
                true
            }
            Err(error) => {
                self.metrics.inc_sink_failures(1);
                error!(
                    %error,
                    window_start = result.window.start,
                    key = %row.key,
                    "failed to write window highlight"
                );
                false
            }
        }
    }
}

/// Run the job over everything `source` currently holds for the configured topic.
///
/// Each worker reads the partitions `p` with `p % workers == index`. The job ends once
/// every partition is drained; open windows are then handled by the shutdown policy.
pub fn run_job<M, S>(
    config: &JobConfig,
    source: Arc<M>,
    sink: SharedSink<S>,
    metrics: MetricsRegistry,
) -> Result<MetricsSnapshot>
where
    M: MessageSource,
    S: Sink + 'static,
{
    config.validate()?;
    let spec = config.window_spec()?;
    let rule = config.rule();
    let partitions = source
        .partitions(&config.topic)
        .with_context(|| format!("failed to look up topic {}", config.topic))?;

    let mut setup = sink.clone();
    setup
        .ensure_table(&config.table)
        .with_context(|| format!("failed to prepare table {}", config.table.name))?;

    info!(
        topic = %config.topic,
        partitions,
        workers = config.workers,
        window_ms = config.window_ms,
        slide_ms = config.slide_ms,
        "starting highlights job"
    );

    let config = Arc::new(config.clone());
    let job_metrics = metrics.clone();
    let job_sink = sink.clone();
    let outcomes = start_runtime(config.workers, move |index, worker| -> Result<()> {
        let peers = worker.peers();
        let writer = Rc::new(RefCell::new(WinnerWriter::new(
            job_sink.clone(),
            config.clone(),
            job_metrics.clone(),
        )));
        let dataflow_writer = writer.clone();
        let observer = job_metrics.clone();
        let mut probe = ProbeHandle::new();

        let mut input = worker.dataflow::<u64, _, _>(|scope| {
            let (input, messages) = scope.new_input();
            let records = decode_records(&messages, observer.clone());
            let partials = window_extremum(&records, spec, rule, observer);
            merge_partials(&partials, rule)
                .inspect(move |result| dataflow_writer.borrow_mut().write(result))
                .probe_with(&mut probe);
            input
        });

        let mut cursors: Vec<PartitionCursor> = (0..partitions)
            .filter(|partition| *partition as usize % peers == index)
            .map(|partition| PartitionCursor {
                partition,
                offset: 0,
                exhausted: false,
                watermark: BoundedOutOfOrderness::new(config.allowed_lateness_ms),
            })
            .collect();
        info!(
            worker = index,
            partitions = ?cursors.iter().map(|c| c.partition).collect::<Vec<_>>(),
            "worker assigned partitions"
        );

        while cursors.iter().any(|cursor| !cursor.exhausted) {
            for cursor in cursors.iter_mut().filter(|cursor| !cursor.exhausted) {
                let batch = source
                    .fetch(&config.topic, cursor.partition, cursor.offset, config.fetch_batch)
                    .with_context(|| {
                        format!("failed to read partition {} of {}", cursor.partition, config.topic)
                    })?;
                if batch.is_empty() {
                    cursor.exhausted = true;
                    continue;
                }
                cursor.offset += batch.len() as u64;
                for message in batch {
                    cursor.watermark.observe(message.timestamp);
                    input.send(message);
                }
            }

            // The slowest live partition holds the worker back.
            let watermark = cursors
                .iter()
                .filter(|cursor| !cursor.exhausted)
                .map(|cursor| cursor.watermark.watermark())
                .collect::<Option<Vec<_>>>()
                .and_then(|marks| marks.into_iter().min());
            if let Some(mark) = watermark {
                let epoch = epoch_of(mark);
                if epoch > *input.time() {
                    input.advance_to(epoch);
                }
            }
            worker.step_while(|| probe.less_than(input.time()));
        }

        info!(worker = index, "worker drained its partitions");
        drop(input);
        while worker.step() {}
        writer.borrow_mut().finish();
        Ok(())
    })?;

    for outcome in outcomes {
        outcome?;
    }

    let mut done = sink;
    done.flush().context("failed to flush sink")?;
    let snapshot = metrics.snapshot();
    info!(
        written = snapshot.sink_writes,
        failed = snapshot.sink_failures,
        late = snapshot.late_records,
        decode_errors = snapshot.decode_errors,
        "highlights job finished"
    );
    Ok(snapshot)
}
