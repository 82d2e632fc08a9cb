use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use ht_core::DecodeError;
use ht_views::{AggregatorStats, StageObserver};

/// Pipeline counters shared by every worker.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    messages_read: AtomicU64,
    records_decoded: AtomicU64,
    decode_errors: AtomicU64,
    late_records: AtomicU64,
    late_assignments: AtomicU64,
    watermark_regressions: AtomicU64,
    windows_opened: AtomicU64,
    partials_emitted: AtomicU64,
    windows_discarded: AtomicU64,
    results_released: AtomicU64,
    sink_writes: AtomicU64,
    sink_failures: AtomicU64,
    sink_redeliveries: AtomicU64,
    winners_dropped: AtomicU64,
    open_windows_peak: AtomicU64,
}

impl MetricsRegistry {
    pub fn inc_messages_read(&self, delta: u64) {
        self.inner.messages_read.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_records_decoded(&self, delta: u64) {
        self.inner.records_decoded.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_decode_errors(&self, delta: u64) {
        self.inner.decode_errors.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_sink_writes(&self, delta: u64) {
        self.inner.sink_writes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_sink_failures(&self, delta: u64) {
        self.inner.sink_failures.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_sink_redeliveries(&self, delta: u64) {
        self.inner.sink_redeliveries.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_winners_dropped(&self, delta: u64) {
        self.inner.winners_dropped.fetch_add(delta, Ordering::Relaxed);
    }

    /// Fold one worker's aggregator counters into the registry.
    pub fn add_window_stats(&self, delta: &AggregatorStats) {
        let inner = &self.inner;
        inner.late_records.fetch_add(delta.late_records, Ordering::Relaxed);
        inner
            .late_assignments
            .fetch_add(delta.late_assignments, Ordering::Relaxed);
        inner
            .watermark_regressions
            .fetch_add(delta.watermark_regressions, Ordering::Relaxed);
        inner
            .windows_opened
            .fetch_add(delta.windows_opened, Ordering::Relaxed);
        inner
            .partials_emitted
            .fetch_add(delta.windows_emitted, Ordering::Relaxed);
        inner
            .windows_discarded
            .fetch_add(delta.windows_discarded, Ordering::Relaxed);
        inner
            .results_released
            .fetch_add(delta.results_released, Ordering::Relaxed);
    }

    pub fn record_open_windows(&self, open: u64) {
        self.inner
            .open_windows_peak
            .fetch_max(open, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            messages_read: inner.messages_read.load(Ordering::Relaxed),
            records_decoded: inner.records_decoded.load(Ordering::Relaxed),
            decode_errors: inner.decode_errors.load(Ordering::Relaxed),
            late_records: inner.late_records.load(Ordering::Relaxed),
            late_assignments: inner.late_assignments.load(Ordering::Relaxed),
            watermark_regressions: inner.watermark_regressions.load(Ordering::Relaxed),
            windows_opened: inner.windows_opened.load(Ordering::Relaxed),
            partials_emitted: inner.partials_emitted.load(Ordering::Relaxed),
            windows_discarded: inner.windows_discarded.load(Ordering::Relaxed),
            results_released: inner.results_released.load(Ordering::Relaxed),
            sink_writes: inner.sink_writes.load(Ordering::Relaxed),
            sink_failures: inner.sink_failures.load(Ordering::Relaxed),
            sink_redeliveries: inner.sink_redeliveries.load(Ordering::Relaxed),
            winners_dropped: inner.winners_dropped.load(Ordering::Relaxed),
            open_windows_peak: inner.open_windows_peak.load(Ordering::Relaxed),
        }
    }
}

impl StageObserver for MetricsRegistry {
    fn on_message(&self) {
        self.inc_messages_read(1);
    }

    fn on_decoded(&self) {
        self.inc_records_decoded(1);
    }

    fn on_decode_error(&self, _error: &DecodeError) {
        self.inc_decode_errors(1);
    }

    fn on_window_stats(&self, delta: &AggregatorStats, open_windows: usize) {
        self.add_window_stats(delta);
        self.record_open_windows(open_windows as u64);
    }
}

/// Counter values at one point in time. Window counts are per worker: a window seen
/// by two workers is opened (and emitted as a partial) twice.
///
/// `windows_discarded` counts windows dropped without being emitted; `results_released`
/// counts emitted partials the aggregators stopped retaining. `sink_failures` counts
/// failed writes including failed redeliveries; `winners_dropped` counts winners that
/// never reached the sink.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_read: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    pub late_records: u64,
    pub late_assignments: u64,
    pub watermark_regressions: u64,
    pub windows_opened: u64,
    pub partials_emitted: u64,
    pub windows_discarded: u64,
    pub results_released: u64,
    pub sink_writes: u64,
    pub sink_failures: u64,
    pub sink_redeliveries: u64,
    pub winners_dropped: u64,
    pub open_windows_peak: u64,
}

impl MetricsSnapshot {
    pub fn to_json_line(&self, label: &str, elapsed: Option<Duration>) -> String {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            label: &'a str,
            #[serde(flatten)]
            counters: &'a MetricsSnapshot,
            elapsed_ms: Option<u128>,
        }

        let payload = Snapshot {
            label,
            counters: self,
            elapsed_ms: elapsed.map(|d| d.as_millis()),
        };
        serde_json::to_string(&payload).unwrap_or_else(|_| String::from("{}"))
    }
}

pub struct JobTimer {
    start: Instant,
}

impl JobTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
