//! Windowed views over the record stream: sliding-window assignment, the extremum
//! aggregator, and the timely operators that host it.

use ht_core::Timestamp;

pub mod dataflow;
pub mod extremum;
pub mod window;

pub use dataflow::{decode_records, merge_partials, window_extremum, StageObserver, WindowSpec};
pub use extremum::{
    Accumulated, AggregatorStats, ShutdownPolicy, WindowPhase, WindowResult, WindowedExtremum,
    DEFAULT_RETENTION,
};
pub use window::{BoundedOutOfOrderness, SlidingWindows, Window, WindowStarts};

/// Dataflow epoch for an event time. Times before the epoch map to zero.
pub fn epoch_of(timestamp: Timestamp) -> u64 {
    u64::try_from(timestamp).unwrap_or(0)
}

/// Event time for a dataflow epoch.
pub fn timestamp_of(epoch: u64) -> Timestamp {
    Timestamp::try_from(epoch).unwrap_or(Timestamp::MAX)
}
