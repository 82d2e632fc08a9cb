//! Comparison rules used to pick the single most significant record of a window.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use ht_core::Record;

/// Outcome of comparing two candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Left,
    Right,
    Tie,
}

/// A total order over candidates. `rank(a, b) == Greater` means `a` is the better one.
///
/// Implementations must never fail on valid input; anything that could make a
/// candidate unrankable is rejected when it is decoded.
pub trait ComparisonRule<T>: Send + Sync {
    fn rank(&self, a: &T, b: &T) -> Ordering;

    fn judge(&self, a: &T, b: &T) -> Verdict {
        match self.rank(a, b) {
            Ordering::Greater => Verdict::Left,
            Ordering::Less => Verdict::Right,
            Ordering::Equal => Verdict::Tie,
        }
    }

    /// True when `challenger` should replace `incumbent`. Ties keep the incumbent.
    fn supersedes(&self, challenger: &T, incumbent: &T) -> bool {
        self.judge(challenger, incumbent) == Verdict::Left
    }
}

/// Which sentiment figure is compared first.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SentimentOrder {
    #[default]
    RatioThenScore,
    ScoreThenRatio,
}

/// Higher sentiment wins; records that agree on both figures are broken by id ascending.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SentimentRule {
    pub order: SentimentOrder,
}

impl SentimentRule {
    pub fn new(order: SentimentOrder) -> Self {
        Self { order }
    }
}

impl ComparisonRule<Record> for SentimentRule {
    fn rank(&self, a: &Record, b: &Record) -> Ordering {
        let (sa, sb) = (a.sentiment(), b.sentiment());
        let ratio = sa.ratio.total_cmp(&sb.ratio);
        let score = sa.score.total_cmp(&sb.score);
        let figures = match self.order {
            SentimentOrder::RatioThenScore => ratio.then(score),
            SentimentOrder::ScoreThenRatio => score.then(ratio),
        };
        // Smaller id ranks higher.
        figures.then_with(|| b.id.cmp(&a.id))
    }
}

impl<T, R: ComparisonRule<T> + ?Sized> ComparisonRule<T> for &R {
    fn rank(&self, a: &T, b: &T) -> Ordering {
        (**self).rank(a, b)
    }
}
