//! Timely operators hosting the window aggregation.
//!
//! The input frontier is the watermark. Every worker aggregates the records it read on
//! its own, emitting each window's partial winner at the window's end epoch; the
//! partials are then routed by window start to one worker which picks the global winner
//! once no more partials for that epoch can arrive.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use timely::dataflow::channels::pact::{Exchange, Pipeline};
use timely::dataflow::operators::generic::operator::Operator;
use timely::dataflow::operators::{Capability, Map};
use timely::dataflow::{Scope, Stream};
use timely::{Data, ExchangeData};
use tracing::{debug, warn};

use ht_core::{DecodeError, RawMessage, Record, Timestamped};
use ht_ranking::ComparisonRule;

use crate::extremum::{AggregatorStats, ShutdownPolicy, WindowResult, WindowedExtremum};
use crate::window::SlidingWindows;
use crate::{epoch_of, timestamp_of};

/// Hooks for counting what flows through the operators. Every method defaults to a no-op.
pub trait StageObserver: Clone + 'static {
    fn on_message(&self) {}
    fn on_decoded(&self) {}
    fn on_decode_error(&self, _error: &DecodeError) {}
    fn on_window_stats(&self, _delta: &AggregatorStats, _open_windows: usize) {}
}

impl StageObserver for () {}

#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    pub windows: SlidingWindows,
    pub shutdown: ShutdownPolicy,
    pub retention: usize,
}

/// Decode raw messages, dropping (and reporting) the ones that do not parse.
pub fn decode_records<G, O>(messages: &Stream<G, RawMessage>, observer: O) -> Stream<G, Record>
where
    G: Scope,
    O: StageObserver,
{
    messages.flat_map(move |message| {
        observer.on_message();
        match Record::decode(&message) {
            Ok(record) => {
                observer.on_decoded();
                Some(record)
            }
            Err(error) => {
                warn!(
                    %error,
                    timestamp = message.timestamp,
                    provenance = ?message.provenance,
                    "dropping undecodable record"
                );
                observer.on_decode_error(&error);
                None
            }
        }
    })
}

/// Per-worker window aggregation. Each result is emitted at its window's end epoch.
pub fn window_extremum<G, T, R, O>(
    records: &Stream<G, T>,
    spec: WindowSpec,
    rule: R,
    observer: O,
) -> Stream<G, WindowResult<T>>
where
    G: Scope<Timestamp = u64>,
    T: Timestamped + Data,
    R: ComparisonRule<T> + 'static,
    O: StageObserver,
{
    records.unary_frontier(Pipeline, "WindowExtremum", move |capability, _info| {
        // Held at or below the frontier for as long as windows may still close.
        let mut held: Option<Capability<u64>> = Some(capability);
        let mut aggregator =
            WindowedExtremum::new(spec.windows, rule).with_retention(spec.retention);
        let mut reported = AggregatorStats::default();
        let mut buffer = Vec::new();

        move |input, output| {
            // Windows the frontier has passed are complete before this batch is looked at.
            let frontier = input.frontier().frontier().first().copied();
            let closed = match frontier {
                Some(epoch) => aggregator.advance_watermark(timestamp_of(epoch)),
                None if held.is_some() => aggregator.flush(spec.shutdown),
                None => Vec::new(),
            };

            if let Some(cap) = held.as_ref() {
                for result in closed {
                    let at = epoch_of(result.window.end).max(*cap.time());
                    output.session(&cap.delayed(&at)).give(result);
                }
            }

            input.for_each(|_time, data| {
                data.swap(&mut buffer);
                for record in buffer.drain(..) {
                    if let Err(error) = aggregator.accumulate(record) {
                        debug!(%error, "dropping late record");
                    }
                }
            });

            match frontier {
                Some(epoch) => {
                    if let Some(cap) = held.as_mut() {
                        if *cap.time() < epoch {
                            cap.downgrade(&epoch);
                        }
                    }
                }
                None => held = None,
            }

            let stats = aggregator.stats();
            if stats != reported {
                observer.on_window_stats(&stats.since(&reported), aggregator.open_windows());
                reported = stats;
            }
        }
    })
}

/// Combine per-worker partials into one winner per window.
pub fn merge_partials<G, T, R>(
    partials: &Stream<G, WindowResult<T>>,
    rule: R,
) -> Stream<G, WindowResult<T>>
where
    G: Scope<Timestamp = u64>,
    T: ExchangeData,
    R: ComparisonRule<T> + 'static,
{
    let route = Exchange::new(|partial: &WindowResult<T>| partial.window.start as u64);
    partials.unary_frontier(route, "MergeWindowPartials", move |_capability, _info| {
        let mut pending: BTreeMap<(u64, i64), (Capability<u64>, WindowResult<T>)> =
            BTreeMap::new();
        let mut buffer = Vec::new();

        move |input, output| {
            input.for_each(|time, data| {
                data.swap(&mut buffer);
                for partial in buffer.drain(..) {
                    match pending.entry((*time.time(), partial.window.start)) {
                        Entry::Occupied(mut entry) => {
                            let (_, best) = entry.get_mut();
                            best.members += partial.members;
                            if rule.supersedes(&partial.record, &best.record) {
                                best.record = partial.record;
                            }
                        }
                        Entry::Vacant(entry) => {
                            entry.insert((time.delayed(time.time()), partial));
                        }
                    }
                }
            });

            let frontier = input.frontier();
            let ready: Vec<(u64, i64)> = pending
                .keys()
                .take_while(|(epoch, _)| !frontier.less_equal(epoch))
                .copied()
                .collect();
            for key in ready {
                if let Some((cap, result)) = pending.remove(&key) {
                    output.session(&cap).give(result);
                }
            }
        }
    })
}
