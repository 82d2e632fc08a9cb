//! Sliding-window extremum selection.
//!
//! [`WindowedExtremum`] keeps one slot per open window, indexed by window start, and
//! retains only the best record seen so far in each. Windows close once the watermark
//! reaches their end; a closed window never accepts records again.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ht_core::{CoreError, Timestamp, Timestamped};
use ht_ranking::ComparisonRule;

use crate::window::{SlidingWindows, Window};

/// Emitted results kept around for re-delivery unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 8;

/// What happens to windows that are still open when the input ends.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Close and emit every open window.
    #[default]
    EmitOpen,
    /// Drop open windows without emitting them.
    DiscardOpen,
}

/// Lifecycle of a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    /// Accepting records.
    Open,
    /// The watermark reached the window end; no more records, result not yet handed out.
    Closing,
    /// Result handed downstream and retained for re-delivery.
    Emitted,
    /// State released.
    Discarded,
}

/// The winner of one window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowResult<T> {
    pub window: Window,
    pub record: T,
    /// Number of records the window saw.
    pub members: u64,
}

/// How one record was spread over its windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accumulated {
    pub windows: usize,
    pub late_windows: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub records_accepted: u64,
    pub late_records: u64,
    pub late_assignments: u64,
    pub watermark_regressions: u64,
    pub windows_opened: u64,
    pub windows_emitted: u64,
    /// Open windows dropped without being emitted.
    pub windows_discarded: u64,
    /// Emitted results let go of, by acknowledgement or by falling out of retention.
    pub results_released: u64,
    pub open_peak: u64,
}

impl AggregatorStats {
    /// Counter increments since `earlier`. The peak is carried over as is.
    pub fn since(&self, earlier: &AggregatorStats) -> AggregatorStats {
        AggregatorStats {
            records_accepted: self.records_accepted.saturating_sub(earlier.records_accepted),
            late_records: self.late_records.saturating_sub(earlier.late_records),
            late_assignments: self.late_assignments.saturating_sub(earlier.late_assignments),
            watermark_regressions: self
                .watermark_regressions
                .saturating_sub(earlier.watermark_regressions),
            windows_opened: self.windows_opened.saturating_sub(earlier.windows_opened),
            windows_emitted: self.windows_emitted.saturating_sub(earlier.windows_emitted),
            windows_discarded: self.windows_discarded.saturating_sub(earlier.windows_discarded),
            results_released: self.results_released.saturating_sub(earlier.results_released),
            open_peak: self.open_peak,
        }
    }
}

#[derive(Debug)]
struct Slot<T> {
    window: Window,
    best: T,
    members: u64,
}

pub struct WindowedExtremum<T, R> {
    windows: SlidingWindows,
    rule: R,
    open: BTreeMap<Timestamp, Slot<T>>,
    emitted: BTreeMap<Timestamp, WindowResult<T>>,
    retention: usize,
    watermark: Option<Timestamp>,
    stats: AggregatorStats,
}

impl<T, R> WindowedExtremum<T, R>
where
    T: Timestamped + Clone,
    R: ComparisonRule<T>,
{
    pub fn new(windows: SlidingWindows, rule: R) -> Self {
        Self {
            windows,
            rule,
            open: BTreeMap::new(),
            emitted: BTreeMap::new(),
            retention: DEFAULT_RETENTION,
            watermark: None,
            stats: AggregatorStats::default(),
        }
    }

    /// Number of emitted results kept for [`reemit`](Self::reemit).
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn windows(&self) -> SlidingWindows {
        self.windows
    }

    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    pub fn phase(&self, start: Timestamp) -> Option<WindowPhase> {
        let window = self.windows.window(start);
        if self.open.contains_key(&start) {
            if self.is_sealed(&window) {
                Some(WindowPhase::Closing)
            } else {
                Some(WindowPhase::Open)
            }
        } else if self.emitted.contains_key(&start) {
            Some(WindowPhase::Emitted)
        } else if self.is_sealed(&window) {
            Some(WindowPhase::Discarded)
        } else {
            None
        }
    }

    /// Offer `record` to every window containing its timestamp.
    ///
    /// Fails with [`CoreError::LateArrival`] only when all of those windows are closed;
    /// otherwise the closed ones are skipped and reported in [`Accumulated::late_windows`].
    pub fn accumulate(&mut self, record: T) -> Result<Accumulated, CoreError> {
        let timestamp = record.timestamp();
        let mut outcome = Accumulated::default();
        for start in self.windows.assign(timestamp) {
            if self.offer(start, &record) {
                outcome.windows += 1;
            } else {
                outcome.late_windows += 1;
            }
        }

        if outcome.windows == 0 && outcome.late_windows > 0 {
            self.stats.late_records += 1;
            return Err(CoreError::LateArrival {
                timestamp,
                watermark: self.watermark.unwrap_or(Timestamp::MIN),
            });
        }
        self.stats.records_accepted += 1;
        self.stats.late_assignments += outcome.late_windows as u64;
        Ok(outcome)
    }

    /// Offer `record` to the single window starting at `start`. The caller is responsible
    /// for the record actually falling into that window.
    pub fn accumulate_into(&mut self, start: Timestamp, record: &T) -> Result<(), CoreError> {
        debug_assert!(self.windows.window(start).contains(record.timestamp()));
        if self.offer(start, record) {
            Ok(())
        } else {
            self.stats.late_assignments += 1;
            Err(CoreError::LateArrival {
                timestamp: record.timestamp(),
                watermark: self.watermark.unwrap_or(Timestamp::MIN),
            })
        }
    }

    /// Move the watermark to `watermark` without emitting. Windows ending at or before it
    /// become [`WindowPhase::Closing`]. Returns false, and changes nothing, on regression.
    pub fn seal(&mut self, watermark: Timestamp) -> bool {
        if let Some(current) = self.watermark {
            if watermark < current {
                self.stats.watermark_regressions += 1;
                debug!(watermark, current, "ignoring watermark regression");
                return false;
            }
        }
        self.watermark = Some(watermark);
        true
    }

    /// Emit every closing window in ascending start order.
    pub fn drain_closing(&mut self) -> Vec<WindowResult<T>> {
        let Some(watermark) = self.watermark else {
            return Vec::new();
        };
        // All windows share one length, so start order is end order.
        let closing: Vec<Timestamp> = self
            .open
            .values()
            .take_while(|slot| slot.window.end <= watermark)
            .map(|slot| slot.window.start)
            .collect();
        closing
            .into_iter()
            .filter_map(|start| self.close_window(start))
            .collect()
    }

    /// Seal up to `watermark` and emit everything that closed.
    pub fn advance_watermark(&mut self, watermark: Timestamp) -> Vec<WindowResult<T>> {
        if !self.seal(watermark) {
            return Vec::new();
        }
        self.drain_closing()
    }

    /// Emit one closing window and release its state. Open windows are left alone.
    pub fn close_window(&mut self, start: Timestamp) -> Option<WindowResult<T>> {
        if self.phase(start) != Some(WindowPhase::Closing) {
            return None;
        }
        let slot = self.open.remove(&start)?;
        let result = WindowResult {
            window: slot.window,
            record: slot.best,
            members: slot.members,
        };
        self.stats.windows_emitted += 1;
        self.emitted.insert(start, result.clone());
        while self.emitted.len() > self.retention {
            if self.emitted.pop_first().is_some() {
                self.stats.results_released += 1;
            }
        }
        Some(result)
    }

    /// The retained result of an emitted window, for retrying a failed handoff.
    pub fn reemit(&self, start: Timestamp) -> Option<&WindowResult<T>> {
        self.emitted.get(&start)
    }

    /// Release a retained result once downstream has it.
    pub fn acknowledge(&mut self, start: Timestamp) -> bool {
        let released = self.emitted.remove(&start).is_some();
        if released {
            self.stats.results_released += 1;
        }
        released
    }

    /// Handle end of input according to `policy`. Afterwards every window that was open is
    /// sealed, so stragglers count as late.
    pub fn flush(&mut self, policy: ShutdownPolicy) -> Vec<WindowResult<T>> {
        let Some(last_end) = self.open.values().next_back().map(|slot| slot.window.end) else {
            return Vec::new();
        };
        let watermark = self.watermark.map_or(last_end, |current| current.max(last_end));
        match policy {
            ShutdownPolicy::EmitOpen => self.advance_watermark(watermark),
            ShutdownPolicy::DiscardOpen => {
                let discarded = self.open.len();
                self.open.clear();
                self.watermark = Some(watermark);
                self.stats.windows_discarded += discarded as u64;
                info!(discarded, "discarded open windows on shutdown");
                Vec::new()
            }
        }
    }

    fn is_sealed(&self, window: &Window) -> bool {
        self.watermark.map_or(false, |watermark| window.end <= watermark)
    }

    fn offer(&mut self, start: Timestamp, record: &T) -> bool {
        let window = self.windows.window(start);
        if self.is_sealed(&window) {
            return false;
        }
        match self.open.entry(start) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.members += 1;
                if self.rule.supersedes(record, &slot.best) {
                    slot.best = record.clone();
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot {
                    window,
                    best: record.clone(),
                    members: 1,
                });
                self.stats.windows_opened += 1;
                self.stats.open_peak = self.stats.open_peak.max(self.open.len() as u64);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ht_core::{Article, ArticleSentiment, Record, SentimentResponse};
    use ht_ranking::SentimentRule;

    fn record(id: &str, timestamp: Timestamp, ratio: f64, score: f64) -> Record {
        Record::new(
            id,
            timestamp,
            ArticleSentiment {
                article: Article::default(),
                sentiment_response: SentimentResponse::new(ratio, score),
            },
        )
    }

    fn aggregator() -> WindowedExtremum<Record, SentimentRule> {
        let windows = SlidingWindows::new(30_000, 10_000).unwrap();
        WindowedExtremum::new(windows, SentimentRule::default())
    }

    fn winners(results: &[WindowResult<Record>]) -> Vec<(Timestamp, &str)> {
        results
            .iter()
            .map(|result| (result.window.start, result.record.id.as_str()))
            .collect()
    }

    #[test]
    fn news_example() {
        let mut agg = aggregator();
        agg.accumulate(record("r1", 0, 0.9, 0.0)).unwrap();
        agg.accumulate(record("r2", 5_000, 0.95, 0.0)).unwrap();
        agg.accumulate(record("r3", 25_000, 0.5, 0.0)).unwrap();

        let results = agg.advance_watermark(50_000);
        assert_eq!(
            winners(&results),
            vec![
                (-20_000, "r2"),
                (-10_000, "r2"),
                (0, "r2"),
                (10_000, "r3"),
                (20_000, "r3"),
            ]
        );
        assert_eq!(results[2].members, 3);
        assert_eq!(results[3].members, 1);
    }

    #[test]
    fn windows_close_only_at_their_end() {
        let mut agg = aggregator();
        agg.accumulate(record("r1", 0, 0.9, 0.0)).unwrap();
        assert!(agg.advance_watermark(9_999).is_empty());
        assert_eq!(winners(&agg.advance_watermark(10_000)), vec![(-20_000, "r1")]);
        assert_eq!(winners(&agg.advance_watermark(29_999)), vec![(-10_000, "r1")]);
        assert_eq!(winners(&agg.advance_watermark(30_000)), vec![(0, "r1")]);
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn full_tie_goes_to_smaller_id() {
        let mut agg = aggregator();
        agg.accumulate(record("b", 1_000, 0.4, 2.0)).unwrap();
        agg.accumulate(record("a", 2_000, 0.4, 2.0)).unwrap();
        let results = agg.advance_watermark(100_000);
        assert!(results.iter().all(|result| result.record.id == "a"));
    }

    #[test]
    fn winner_is_the_maximum_of_its_window() {
        let mut agg = aggregator();
        let inputs: Vec<Record> = (0..40)
            .map(|i| {
                let ratio = ((i * 37) % 11) as f64 / 10.0;
                let score = ((i * 13) % 7) as f64;
                record(&format!("id-{i:02}"), i * 1_500, ratio, score)
            })
            .collect();
        for input in &inputs {
            agg.accumulate(input.clone()).unwrap();
        }
        let rule = SentimentRule::default();
        for result in agg.advance_watermark(1_000_000) {
            let best = inputs
                .iter()
                .filter(|input| result.window.contains(input.timestamp))
                .max_by(|a, b| rule.rank(*a, *b))
                .unwrap();
            assert_eq!(&result.record, best);
        }
    }

    #[test]
    fn reruns_are_identical() {
        let run = || {
            let mut agg = aggregator();
            for i in 0..20i64 {
                agg.accumulate(record(&format!("r{i}"), i * 2_000, (i % 5) as f64, 1.0))
                    .unwrap();
            }
            agg.advance_watermark(200_000)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn empty_windows_emit_nothing() {
        let mut agg = aggregator();
        agg.accumulate(record("r1", 0, 0.9, 0.0)).unwrap();
        agg.accumulate(record("r2", 100_000, 0.9, 0.0)).unwrap();
        let results = agg.advance_watermark(100_000);
        let starts: Vec<Timestamp> = results.iter().map(|r| r.window.start).collect();
        assert_eq!(starts, vec![-20_000, -10_000, 0]);
        assert_eq!(agg.phase(40_000), Some(WindowPhase::Discarded));
    }

    #[test]
    fn late_record_does_not_touch_emitted_result() {
        let mut agg = aggregator();
        agg.accumulate(record("r1", 0, 0.1, 0.0)).unwrap();
        let emitted = agg.advance_watermark(40_000);
        assert_eq!(emitted.len(), 3);

        let late = agg.accumulate(record("late", 1_000, 0.99, 0.0));
        assert_matches!(late, Err(CoreError::LateArrival { timestamp: 1_000, watermark: 40_000 }));
        assert_eq!(agg.stats().late_records, 1);
        assert_eq!(agg.reemit(0).unwrap().record.id, "r1");
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn partially_late_record_feeds_open_windows() {
        let mut agg = aggregator();
        agg.seal(20_000);
        let outcome = agg.accumulate(record("r", 15_000, 0.5, 0.0)).unwrap();
        assert_eq!(outcome, Accumulated { windows: 2, late_windows: 1 });
        assert_eq!(agg.stats().late_assignments, 1);
        assert_eq!(agg.phase(-10_000), Some(WindowPhase::Discarded));
        assert_eq!(agg.phase(0), Some(WindowPhase::Open));
    }

    #[test]
    fn regression_is_ignored() {
        let mut agg = aggregator();
        agg.accumulate(record("r1", 0, 0.9, 0.0)).unwrap();
        agg.advance_watermark(10_000);
        assert!(agg.advance_watermark(5_000).is_empty());
        assert_eq!(agg.watermark(), Some(10_000));
        assert_eq!(agg.stats().watermark_regressions, 1);
    }

    #[test]
    fn phases_follow_the_lifecycle() {
        let mut agg = aggregator().with_retention(1);
        agg.accumulate(record("r1", 0, 0.9, 0.0)).unwrap();
        assert_eq!(agg.phase(0), Some(WindowPhase::Open));
        assert_eq!(agg.close_window(0), None);

        assert!(agg.seal(30_000));
        assert_eq!(agg.phase(0), Some(WindowPhase::Closing));
        assert!(agg.accumulate_into(0, &record("x", 1, 1.0, 0.0)).is_err());

        let result = agg.close_window(0).unwrap();
        assert_eq!(result.record.id, "r1");
        assert_eq!(agg.phase(0), Some(WindowPhase::Emitted));
        assert_eq!(agg.reemit(0), Some(&result));

        assert!(agg.acknowledge(0));
        assert_eq!(agg.stats().results_released, 1);
        assert_eq!(agg.phase(0), Some(WindowPhase::Discarded));
        assert_eq!(agg.reemit(0), None);
    }

    #[test]
    fn retention_bounds_reemittable_results() {
        let mut agg = aggregator().with_retention(2);
        agg.accumulate(record("r1", 0, 0.9, 0.0)).unwrap();
        agg.advance_watermark(30_000);
        assert!(agg.reemit(-20_000).is_none());
        assert!(agg.reemit(-10_000).is_some());
        assert!(agg.reemit(0).is_some());
        assert_eq!(agg.stats().results_released, 1);
        assert_eq!(agg.stats().windows_discarded, 0);
    }

    #[test]
    fn shutdown_emits_open_windows() {
        let mut agg = aggregator();
        agg.accumulate(record("r1", 12_000, 0.9, 0.0)).unwrap();
        agg.advance_watermark(12_000);
        let results = agg.flush(ShutdownPolicy::EmitOpen);
        assert_eq!(winners(&results), vec![(-10_000, "r1"), (0, "r1"), (10_000, "r1")]);
        assert_matches!(
            agg.accumulate(record("r2", 12_500, 0.1, 0.0)),
            Err(CoreError::LateArrival { .. })
        );
    }

    #[test]
    fn shutdown_can_discard_open_windows() {
        let mut agg = aggregator();
        agg.accumulate(record("r1", 12_000, 0.9, 0.0)).unwrap();
        assert!(agg.flush(ShutdownPolicy::DiscardOpen).is_empty());
        assert_eq!(agg.open_windows(), 0);
        assert_eq!(agg.stats().windows_discarded, 3);
        assert_eq!(agg.stats().windows_emitted, 0);
        assert_eq!(agg.stats().results_released, 0);
    }
}
