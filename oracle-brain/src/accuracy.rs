//! Running accuracy of position and pattern predictions.
//!
//! Rates are exact means over every recorded outcome, not decayed.

use serde::{Deserialize, Serialize};

use oracle_core::{Pattern, Vec2};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyTracker {
    position_hits: u64,
    position_total: u64,
    /// Sum of Euclidean errors, for the mean error
    error_sum: f64,
    pattern_hits: u64,
    pattern_total: u64,
}

/// Point-in-time view of the tracker
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyStats {
    pub position_rate: f32,
    pub position_samples: u64,
    pub mean_error: f32,
    pub pattern_rate: f32,
    pub pattern_samples: u64,
}

impl AccuracyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one position outcome; returns whether it was a hit
    pub fn record_position(&mut self, predicted: Vec2, actual: Vec2, tolerance: f32) -> bool {
        let error = predicted.distance(actual);
        let hit = error.is_finite() && error <= tolerance;

        self.position_total += 1;
        if hit {
            self.position_hits += 1;
        }
        if error.is_finite() {
            self.error_sum += error as f64;
        }
        hit
    }

    pub fn record_pattern(&mut self, predicted: Pattern, actual: Pattern) -> bool {
        let hit = predicted == actual;
        self.pattern_total += 1;
        if hit {
            self.pattern_hits += 1;
        }
        hit
    }

    pub fn position_rate(&self) -> f32 {
        ratio(self.position_hits, self.position_total)
    }

    pub fn pattern_rate(&self) -> f32 {
        ratio(self.pattern_hits, self.pattern_total)
    }

    pub fn mean_error(&self) -> f32 {
        if self.position_total == 0 {
            0.0
        } else {
            (self.error_sum / self.position_total as f64) as f32
        }
    }

    pub fn stats(&self) -> AccuracyStats {
        AccuracyStats {
            position_rate: self.position_rate(),
            position_samples: self.position_total,
            mean_error: self.mean_error(),
            pattern_rate: self.pattern_rate(),
            pattern_samples: self.pattern_total,
        }
    }
}

fn ratio(hits: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (hits as f64 / total as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_rate_is_exact_mean() {
        let mut tracker = AccuracyTracker::new();
        let origin = Vec2::ZERO;
        assert!(tracker.record_position(origin, Vec2::new(3.0, 4.0), 5.0));
        assert!(!tracker.record_position(origin, Vec2::new(30.0, 40.0), 5.0));
        assert!(tracker.record_position(origin, origin, 5.0));

        assert!((tracker.position_rate() - 2.0 / 3.0).abs() < 1e-6);
        assert!((tracker.mean_error() - 55.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_pattern_rate() {
        let mut tracker = AccuracyTracker::new();
        tracker.record_pattern(Pattern::Circular, Pattern::Circular);
        tracker.record_pattern(Pattern::Circular, Pattern::Zigzag);
        assert_eq!(tracker.pattern_rate(), 0.5);
        assert_eq!(tracker.stats().pattern_samples, 2);
    }

    #[test]
    fn test_empty_tracker() {
        let tracker = AccuracyTracker::new();
        assert_eq!(tracker.stats(), AccuracyStats::default());
    }
}
