//! # Classifier - Rule-Based Pattern Detection
//!
//! Four independent detectors score the recent motion window: circular,
//! zigzag, strafe and straight. A hysteresis rule turns the scores into a
//! label so the reported pattern does not flap from frame to frame:
//!
//! - top score > adopt threshold and ahead of the runner-up by the margin:
//!   adopt it
//! - top score below the random threshold: `random`, confidence 0
//! - anything else: keep the previous label with decayed confidence,
//!   demoting to `random` once that confidence sinks below the threshold
//!
//! This path does not touch the neural models.

use std::f32::consts::TAU;

use oracle_core::config::ClassifierConfig;
use oracle_core::motion::{angle_delta, heading_changes, AgentState, MotionSample, Pattern};
use oracle_core::MotionHistory;

const CIRCULAR_MIN_SAMPLES: usize = 10;
const ZIGZAG_MIN_SAMPLES: usize = 6;
const STRAFE_MIN_SAMPLES: usize = 5;
const STRAIGHT_MIN_SAMPLES: usize = 5;

/// Raw detector outputs, each in [0, 1]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PatternScores {
    pub circular: f32,
    pub zigzag: f32,
    pub strafe: f32,
    pub straight: f32,
}

impl PatternScores {
    /// Scores sorted best first (stable on ties)
    pub fn ranked(&self) -> [(Pattern, f32); 4] {
        let mut ranked = [
            (Pattern::Circular, self.circular),
            (Pattern::Zigzag, self.zigzag),
            (Pattern::Strafe, self.strafe),
            (Pattern::Straight, self.straight),
        ];
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

/// Result of one classification pass
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PatternEstimate {
    pub pattern: Pattern,
    pub confidence: f32,
    pub scores: PatternScores,
}

/// Heuristic motion classifier
#[derive(Clone, Debug, Default)]
pub struct PatternClassifier {
    config: ClassifierConfig,
}

impl PatternClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify the recent window and write the outcome back to `agent`.
    ///
    /// Also refreshes `agent.average_speed` and
    /// `agent.direction_change_count` from the same window.
    pub fn classify(&self, motion: &MotionHistory, agent: &mut AgentState) -> PatternEstimate {
        let window = motion.recent(self.config.window.max(1));

        agent.average_speed = mean_speed(&window);
        let change_limit = self.config.direction_change_deg.to_radians();
        agent.direction_change_count = turns(&window)
            .iter()
            .filter(|t| t.abs() > change_limit)
            .count() as u32;

        let scores = self.scores_for(&window);
        let (pattern, confidence) = self.resolve(&scores, agent);
        agent.current_pattern = pattern;
        agent.pattern_confidence = confidence;

        PatternEstimate {
            pattern,
            confidence,
            scores,
        }
    }

    /// Detector scores for the recent window, without side effects
    pub fn scores(&self, motion: &MotionHistory) -> PatternScores {
        self.scores_for(&motion.recent(self.config.window.max(1)))
    }

    fn scores_for(&self, window: &[&MotionSample]) -> PatternScores {
        PatternScores {
            circular: self.circular(window),
            zigzag: self.zigzag(window),
            strafe: self.strafe(window),
            straight: self.straight(window),
        }
    }

    /// Hysteresis rule. Reads the previous label from `agent`.
    pub(crate) fn resolve(&self, scores: &PatternScores, agent: &AgentState) -> (Pattern, f32) {
        let ranked = scores.ranked();
        let (top, top_score) = ranked[0];
        let runner_up = ranked[1].1;

        if top_score > self.config.adopt_threshold
            && top_score - runner_up > self.config.adopt_margin
        {
            return (top, top_score);
        }

        if top_score < self.config.random_threshold {
            return (Pattern::Random, 0.0);
        }

        let decayed = agent.pattern_confidence * self.config.confidence_decay;
        if decayed < self.config.random_threshold {
            (Pattern::Random, decayed)
        } else {
            (agent.current_pattern, decayed)
        }
    }

    // ========================================================================
    // DETECTORS
    // ========================================================================

    fn circular(&self, window: &[&MotionSample]) -> f32 {
        let c = &self.config;
        if window.len() < CIRCULAR_MIN_SAMPLES || mean_speed(window) < c.circular_min_speed {
            return 0.0;
        }

        let n = window.len() as f32;
        let cx = window.iter().map(|s| s.x).sum::<f32>() / n;
        let cy = window.iter().map(|s| s.y).sum::<f32>() / n;

        let radii: Vec<f32> = window
            .iter()
            .map(|s| ((s.x - cx).powi(2) + (s.y - cy).powi(2)).sqrt())
            .collect();
        let mean_radius = radii.iter().sum::<f32>() / n;
        if mean_radius < c.circular_min_radius {
            return 0.0;
        }

        let consistency = (1.0 - std_dev(&radii, mean_radius) / mean_radius).clamp(0.0, 1.0);
        if consistency < c.circular_min_consistency {
            return 0.0;
        }

        let angles: Vec<f32> = window.iter().map(|s| (s.y - cy).atan2(s.x - cx)).collect();
        let steps: Vec<f32> = angles.windows(2).map(|w| angle_delta(w[0], w[1])).collect();
        let rotation = steps.iter().sum::<f32>().abs();
        if rotation < c.circular_min_rotation_deg.to_radians() {
            return 0.0;
        }

        let positive = steps.iter().filter(|s| **s > 0.0).count();
        let negative = steps.iter().filter(|s| **s < 0.0).count();
        let agreement = positive.max(negative) as f32 / steps.len() as f32;
        if agreement < c.circular_min_sign_agreement {
            return 0.0;
        }

        0.4 * consistency + 0.3 * (rotation / TAU).min(1.0) + 0.3 * agreement
    }

    fn zigzag(&self, window: &[&MotionSample]) -> f32 {
        let c = &self.config;
        if window.len() < ZIGZAG_MIN_SAMPLES || mean_speed(window) < c.zigzag_min_speed {
            return 0.0;
        }

        let turns = turns(window);
        let limit = c.zigzag_turn_deg.to_radians();
        let changes: Vec<f32> = turns.iter().copied().filter(|t| t.abs() > limit).collect();

        let change_ratio = changes.len() as f32 / turns.len() as f32;
        if change_ratio < c.zigzag_min_change_ratio || changes.len() < 2 {
            return 0.0;
        }

        let flips = changes.windows(2).filter(|w| w[0].signum() != w[1].signum()).count();
        let flip_ratio = flips as f32 / (changes.len() - 1) as f32;
        if flip_ratio < c.zigzag_min_flip_ratio {
            return 0.0;
        }

        let alternating = if changes.len() >= 3 {
            let total = (changes.len() - 2) as f32;
            changes
                .windows(3)
                .filter(|w| w[0].signum() != w[1].signum() && w[1].signum() != w[2].signum())
                .count() as f32
                / total
        } else {
            0.0
        };

        (0.5 * flip_ratio + 0.3 * (change_ratio / 0.6).min(1.0) + 0.2 * alternating).min(1.0)
    }

    /// Held heading with a modulated speed
    fn strafe(&self, window: &[&MotionSample]) -> f32 {
        let c = &self.config;
        if window.len() < STRAFE_MIN_SAMPLES || mean_speed(window) < c.strafe_min_speed {
            return 0.0;
        }

        let variation = speed_variation(window);
        if variation <= c.steady_speed_variation || variation > c.strafe_max_speed_variation {
            return 0.0;
        }

        let moving: Vec<&MotionSample> =
            window.iter().copied().filter(|s| s.has_heading()).collect();
        if moving.len() < STRAFE_MIN_SAMPLES {
            return 0.0;
        }

        let (sin, cos) = moving
            .iter()
            .fold((0.0, 0.0), |(s, co), m| (s + m.direction.sin(), co + m.direction.cos()));
        let mean_direction = sin.atan2(cos);

        let deviations: Vec<f32> = moving
            .iter()
            .map(|s| angle_delta(mean_direction, s.direction).abs())
            .collect();
        let mean_dev = deviations.iter().sum::<f32>() / deviations.len() as f32;
        let max_dev = deviations.iter().copied().fold(0.0, f32::max);

        let mean_limit = c.strafe_mean_deviation_deg.to_radians();
        if mean_dev > mean_limit || max_dev > c.strafe_max_deviation_deg.to_radians() {
            return 0.0;
        }

        0.6 * (1.0 - mean_dev / mean_limit) + 0.4 * (1.0 - variation)
    }

    /// Held heading at a steady speed
    fn straight(&self, window: &[&MotionSample]) -> f32 {
        let c = &self.config;
        if window.len() < STRAIGHT_MIN_SAMPLES || mean_speed(window) < c.straight_min_speed {
            return 0.0;
        }
        if speed_variation(window) > c.steady_speed_variation {
            return 0.0;
        }

        let max_turn = turns(window).iter().map(|t| t.abs()).fold(0.0, f32::max);
        let turn_limit = c.straight_max_turn_deg.to_radians();
        if max_turn > turn_limit {
            return 0.0;
        }

        let lateral = lateral_deviation(window);
        if lateral > c.straight_max_lateral_px {
            return 0.0;
        }

        0.4 * (1.0 - max_turn / turn_limit)
            + 0.3 * (1.0 - lateral / c.straight_max_lateral_px)
            + 0.3 * speed_consistency(window)
    }
}

// ============================================================================
// WINDOW STATISTICS
// ============================================================================

fn mean_speed(window: &[&MotionSample]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|s| s.speed).sum::<f32>() / window.len() as f32
}

/// Wrapped heading change between consecutive moving samples
fn turns(window: &[&MotionSample]) -> Vec<f32> {
    heading_changes(window.iter().copied())
}

fn std_dev(values: &[f32], mean: f32) -> f32 {
    let n = values.len().max(1) as f32;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt()
}

/// Coefficient of variation of speed over the moving samples
fn speed_variation(window: &[&MotionSample]) -> f32 {
    let speeds: Vec<f32> = window
        .iter()
        .filter(|s| s.has_heading())
        .map(|s| s.speed)
        .collect();
    if speeds.is_empty() {
        return f32::INFINITY;
    }
    let mean = speeds.iter().sum::<f32>() / speeds.len() as f32;
    std_dev(&speeds, mean) / mean
}

/// 1 - speed variation, in [0, 1]
fn speed_consistency(window: &[&MotionSample]) -> f32 {
    (1.0 - speed_variation(window)).clamp(0.0, 1.0)
}

/// Mean absolute residual of a least-squares fit of x over the sample index
fn lateral_deviation(window: &[&MotionSample]) -> f32 {
    let n = window.len() as f32;
    let mean_i = (n - 1.0) / 2.0;
    let mean_x = window.iter().map(|s| s.x).sum::<f32>() / n;

    let (mut cov, mut var) = (0.0, 0.0);
    for (i, s) in window.iter().enumerate() {
        let di = i as f32 - mean_i;
        cov += di * (s.x - mean_x);
        var += di * di;
    }
    let slope = if var > f32::EPSILON { cov / var } else { 0.0 };

    window
        .iter()
        .enumerate()
        .map(|(i, s)| (s.x - (mean_x + slope * (i as f32 - mean_i))).abs())
        .sum::<f32>()
        / n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(points: impl IntoIterator<Item = (f32, f32)>) -> MotionHistory {
        let mut motion = MotionHistory::default();
        for (t, (x, y)) in points.into_iter().enumerate() {
            motion.record_position(x, y, t as u64 * 16);
        }
        motion
    }

    fn straight_line() -> MotionHistory {
        history((0..20).map(|i| (i as f32 * 3.0, 0.0)))
    }

    #[test]
    fn test_straight_line() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        let estimate = classifier.classify(&straight_line(), &mut agent);

        assert_eq!(estimate.pattern, Pattern::Straight);
        assert!(estimate.confidence > 0.6, "confidence {}", estimate.confidence);
        assert_eq!(agent.current_pattern, Pattern::Straight);
        assert!((agent.average_speed - 3.0).abs() < 1e-4);
        assert_eq!(agent.direction_change_count, 0);
    }

    #[test]
    fn test_fifteen_samples_moving_down_are_straight() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        let down = history((0..15).map(|i| (100.0, i as f32 * 3.0)));
        let estimate = classifier.classify(&down, &mut agent);

        assert_eq!(estimate.pattern, Pattern::Straight, "{:?}", estimate.scores);
        assert!(estimate.confidence > 0.6, "confidence {}", estimate.confidence);
        assert_eq!(agent.direction_change_count, 0);
    }

    #[test]
    fn test_strafe() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        // Held heading, speed pulsing between 3.6 and 2.4 px/frame
        let mut y = 0.0;
        let strafe = history((0..20).map(|i| {
            y += if (i / 2) % 2 == 0 { 3.6 } else { 2.4 };
            (50.0, y)
        }));
        let estimate = classifier.classify(&strafe, &mut agent);

        assert_eq!(estimate.pattern, Pattern::Strafe, "{:?}", estimate.scores);
        assert_eq!(estimate.scores.straight, 0.0);
        assert!(estimate.confidence > 0.6);
    }

    #[test]
    fn test_slow_motion_is_random() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        agent.current_pattern = Pattern::Straight;
        agent.pattern_confidence = 0.9;

        let slow = history((0..20).map(|i| (i as f32 * 1.0, 0.0)));
        let estimate = classifier.classify(&slow, &mut agent);

        assert_eq!(estimate.scores, PatternScores::default());
        assert_eq!(estimate.pattern, Pattern::Random);
        assert_eq!(estimate.confidence, 0.0);
    }

    #[test]
    fn test_short_history_is_random() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        let estimate = classifier.classify(&history([(0.0, 0.0), (5.0, 0.0)]), &mut agent);
        assert_eq!(estimate.pattern, Pattern::Random);
        assert_eq!(estimate.confidence, 0.0);
    }

    #[test]
    fn test_circle() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        let circle = history((0..20).map(|i| {
            let theta = i as f32 * 0.45;
            (200.0 + 40.0 * theta.cos(), 200.0 + 40.0 * theta.sin())
        }));
        let estimate = classifier.classify(&circle, &mut agent);

        assert_eq!(estimate.pattern, Pattern::Circular, "{:?}", estimate.scores);
        assert_eq!(estimate.scores.straight, 0.0);
    }

    #[test]
    fn test_zigzag() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        let step = 3.0 * std::f32::consts::FRAC_1_SQRT_2;
        let zigzag = history((0..20).map(|i| {
            let x = i as f32 * step;
            let y = if i % 2 == 0 { 0.0 } else { step };
            (x, y)
        }));
        let estimate = classifier.classify(&zigzag, &mut agent);

        assert_eq!(estimate.pattern, Pattern::Zigzag, "{:?}", estimate.scores);
        // Every inter-frame turn is 90°
        assert_eq!(agent.direction_change_count, 14);
    }

    #[test]
    fn test_hysteresis_keeps_previous_label() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        agent.current_pattern = Pattern::Circular;
        agent.pattern_confidence = 0.8;

        // Ambiguous: top score in the middle band
        let scores = PatternScores {
            straight: 0.5,
            strafe: 0.45,
            ..PatternScores::default()
        };
        let (pattern, confidence) = classifier.resolve(&scores, &agent);
        assert_eq!(pattern, Pattern::Circular);
        assert!((confidence - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_hysteresis_demotes_when_confidence_decays() {
        let classifier = PatternClassifier::default();
        let mut agent = AgentState::default();
        agent.current_pattern = Pattern::Zigzag;
        agent.pattern_confidence = 0.32;

        let scores = PatternScores {
            circular: 0.4,
            ..PatternScores::default()
        };
        let (pattern, confidence) = classifier.resolve(&scores, &agent);
        assert_eq!(pattern, Pattern::Random);
        assert!(confidence < 0.3);
    }

    #[test]
    fn test_close_scores_do_not_adopt() {
        let classifier = PatternClassifier::default();
        let agent = AgentState::default();
        let scores = PatternScores {
            straight: 0.9,
            strafe: 0.75,
            ..PatternScores::default()
        };
        // Margin 0.15 is not enough; previous label was random at 0
        let (pattern, _) = classifier.resolve(&scores, &agent);
        assert_eq!(pattern, Pattern::Random);
    }
}
