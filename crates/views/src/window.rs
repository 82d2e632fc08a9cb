use std::time::Duration;

use serde::{Deserialize, Serialize};

use ht_core::{CoreError, Timestamp};

/// A half-open interval `[start, end)` of event time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Window {
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

/// Overlapping windows of fixed `length`, one starting at every multiple of `slide`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindows {
    length: i64,
    slide: i64,
}

impl SlidingWindows {
    pub fn new(length_ms: i64, slide_ms: i64) -> Result<Self, CoreError> {
        if slide_ms <= 0 || length_ms < slide_ms {
            return Err(CoreError::InvalidWindow { length_ms, slide_ms });
        }
        Ok(Self {
            length: length_ms,
            slide: slide_ms,
        })
    }

    pub fn from_durations(length: Duration, slide: Duration) -> Result<Self, CoreError> {
        let length_ms = i64::try_from(length.as_millis()).unwrap_or(i64::MAX);
        let slide_ms = i64::try_from(slide.as_millis()).unwrap_or(i64::MAX);
        Self::new(length_ms, slide_ms)
    }

    /// Non-overlapping windows.
    pub fn tumbling(length_ms: i64) -> Result<Self, CoreError> {
        Self::new(length_ms, length_ms)
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn slide(&self) -> i64 {
        self.slide
    }

    pub fn window(&self, start: Timestamp) -> Window {
        Window {
            start,
            end: start.saturating_add(self.length),
        }
    }

    /// Starts of every window containing `timestamp`: the multiples of the slide in
    /// `(timestamp - length, timestamp]`, ascending.
    pub fn assign(&self, timestamp: Timestamp) -> WindowStarts {
        let lower = timestamp.saturating_sub(self.length);
        // The first multiple above `lower` lies in `(lower, timestamp]`, so this cannot overflow.
        let first = (lower.div_euclid(self.slide) + 1) * self.slide;
        WindowStarts {
            next: Some(first),
            last: timestamp,
            slide: self.slide,
        }
    }
}

/// Iterator returned by [`SlidingWindows::assign`].
#[derive(Debug, Clone)]
pub struct WindowStarts {
    next: Option<Timestamp>,
    last: Timestamp,
    slide: i64,
}

impl Iterator for WindowStarts {
    type Item = Timestamp;

    fn next(&mut self) -> Option<Timestamp> {
        let start = self.next.filter(|start| *start <= self.last)?;
        self.next = start.checked_add(self.slide);
        Some(start)
    }
}

/// Watermark for a source whose records may be out of order by at most `lateness_ms`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundedOutOfOrderness {
    lateness_ms: i64,
    max_seen: Option<Timestamp>,
}

impl BoundedOutOfOrderness {
    pub fn new(lateness_ms: i64) -> Self {
        Self {
            lateness_ms: lateness_ms.max(0),
            max_seen: None,
        }
    }

    pub fn observe(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        self.max_seen = Some(self.max_seen.map_or(timestamp, |seen| seen.max(timestamp)));
        self.watermark()
    }

    /// No record older than this is expected any more.
    pub fn watermark(&self) -> Option<Timestamp> {
        self.max_seen.map(|seen| seen.saturating_sub(self.lateness_ms))
    }
}
