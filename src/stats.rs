// ============================================================================
// RUNNING STATISTICS
// ============================================================================
// Per-key online statistics for the collector. The mean is maintained
// incrementally over every value ever recorded; percentiles are estimated
// from a bounded window of the most recent values only.
// ============================================================================

use std::collections::VecDeque;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::DEFAULT_PERCENTILE_WINDOW;

/// Online statistics for one metric key.
///
/// `percentile` is an approximation: it only sees the last `window` values,
/// not the lifetime distribution.
#[derive(Debug, Clone)]
pub struct RunningStat {
    count: u64,
    mean: f64,
    min: f64,
    max: f64,
    last: f64,
    recent_values: VecDeque<f64>,
    window: usize,
}

impl RunningStat {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_PERCENTILE_WINDOW)
    }

    /// Create a stat that keeps `window` recent values (at least one).
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            count: 0,
            mean: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
            recent_values: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Record a new observation.
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;

        if self.recent_values.len() == self.window {
            self.recent_values.pop_front();
        }
        self.recent_values.push_back(value);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    #[inline]
    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    #[inline]
    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max }
    }

    #[inline]
    pub fn last(&self) -> f64 {
        self.last
    }

    /// Values currently in the percentile window, oldest first
    pub fn recent_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.recent_values.iter().copied()
    }

    /// Approximate percentile over the recent window: the value at index
    /// `floor(len * p)` of the sorted window. Sorting on read is fine because
    /// the window is capped.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.recent_values.is_empty() {
            return None;
        }

        let mut sorted: Vec<OrderedFloat<f64>> =
            self.recent_values.iter().copied().map(OrderedFloat).collect();
        sorted.sort_unstable();

        let len = sorted.len();
        let idx = ((len as f64 * p.clamp(0.0, 1.0)).floor() as usize).min(len - 1);
        Some(sorted[idx].into_inner())
    }

    pub fn summary(&self) -> StatSummary {
        StatSummary {
            count: self.count,
            mean: self.mean,
            min: self.min(),
            max: self.max(),
            last: self.last,
            p50: self.percentile(0.50),
            p95: self.percentile(0.95),
        }
    }
}

impl Default for RunningStat {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned point-in-time view of a [`RunningStat`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    /// Approximate; computed over the recent window only
    pub p50: Option<f64>,
    /// Approximate; computed over the recent window only
    pub p95: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_stat() {
        let stat = RunningStat::new();
        assert_eq!(stat.count(), 0);
        assert_eq!(stat.mean(), 0.0);
        assert_eq!(stat.min(), 0.0);
        assert_eq!(stat.percentile(0.95), None);
    }

    #[test]
    fn test_window_is_bounded_but_mean_is_lifetime() {
        let mut stat = RunningStat::with_window(3);
        for v in [10.0, 20.0, 30.0, 40.0] {
            stat.record(v);
        }

        assert_eq!(stat.count(), 4);
        assert!((stat.mean() - 25.0).abs() < 1e-9);
        assert_eq!(stat.recent_values().collect::<Vec<_>>(), vec![20.0, 30.0, 40.0]);
        assert_eq!(stat.min(), 10.0);
        assert_eq!(stat.max(), 40.0);
    }

    #[test]
    fn test_single_value_percentiles() {
        let mut stat = RunningStat::new();
        stat.record(42.0);
        assert_eq!(stat.percentile(0.0), Some(42.0));
        assert_eq!(stat.percentile(0.95), Some(42.0));
        assert_eq!(stat.percentile(1.0), Some(42.0));
    }

    #[test]
    fn test_p95_of_one_to_hundred() {
        let mut stat = RunningStat::new();
        for v in (1..=100).rev() {
            stat.record(v as f64);
        }
        // sorted[floor(100 * 0.95)] = sorted[95] = 96
        assert_eq!(stat.percentile(0.95), Some(96.0));
        assert_eq!(stat.summary().p50, Some(51.0));
    }

    proptest! {
        #[test]
        fn incremental_mean_matches_batch_mean(
            values in prop::collection::vec(0.0f64..100_000.0, 1..500)
        ) {
            let mut stat = RunningStat::new();
            for v in &values {
                stat.record(*v);
            }
            let batch = values.iter().sum::<f64>() / values.len() as f64;
            prop_assert!((stat.mean() - batch).abs() <= 1e-6 * batch.max(1.0));
            prop_assert_eq!(stat.count(), values.len() as u64);
        }

        #[test]
        fn percentile_uses_last_hundred_values(
            values in prop::collection::vec(0.0f64..10_000.0, 1..300)
        ) {
            let mut stat = RunningStat::new();
            for v in &values {
                stat.record(*v);
            }

            let start = values.len().saturating_sub(100);
            let mut window: Vec<f64> = values[start..].to_vec();
            window.sort_by(|a, b| a.total_cmp(b));
            let expected = window[(window.len() as f64 * 0.95).floor() as usize];

            prop_assert_eq!(stat.percentile(0.95), Some(expected));
        }
    }
}
