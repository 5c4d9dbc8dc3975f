//! # Ensemble - Confidence-Weighted Fusion
//!
//! Each predictor returns a position/velocity guess with a confidence. Its
//! effective weight is `prior weight × confidence`; the fused output is the
//! effective-weight average. A lone contributing source is passed through
//! exactly. When nothing contributes, the agent's current position comes
//! back with minimal confidence.
//!
//! How priors move over time is a `FusionStrategy`, chosen from the
//! configured `FusionPolicy`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use oracle_core::config::FusionPolicy;
use oracle_core::Vec2;

/// Identity of an ensemble member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PredictorSource {
    Neural,
    Knn,
}

impl PredictorSource {
    pub const ALL: [PredictorSource; 2] = [PredictorSource::Neural, PredictorSource::Knn];

    pub fn name(self) -> &'static str {
        match self {
            PredictorSource::Neural => "neural",
            PredictorSource::Knn => "knn",
        }
    }
}

impl fmt::Display for PredictorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// WEIGHTS
// ============================================================================

/// Normalized per-source weights, each at least `floor`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    weights: BTreeMap<PredictorSource, f32>,
    floor: f32,
}

impl EnsembleWeights {
    pub fn new(priors: impl IntoIterator<Item = (PredictorSource, f32)>, floor: f32) -> Self {
        let mut weights = Self {
            weights: priors.into_iter().map(|(s, w)| (s, w.max(0.0))).collect(),
            floor: floor.max(0.0),
        };
        weights.normalize();
        weights
    }

    pub fn get(&self, source: PredictorSource) -> f32 {
        self.weights.get(&source).copied().unwrap_or(0.0)
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    pub fn iter(&self) -> impl Iterator<Item = (PredictorSource, f32)> + '_ {
        self.weights.iter().map(|(s, w)| (*s, *w))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Overwrite one raw weight (renormalize afterwards)
    pub(crate) fn set_raw(&mut self, source: PredictorSource, weight: f32) {
        self.weights.insert(source, weight.max(0.0));
    }

    /// Rescale to sum to 1, then lift weights under the floor to it and
    /// take the shortfall from the others in proportion. Weights that
    /// already sum to 1 above the floor come back unchanged.
    pub fn normalize(&mut self) {
        let n = self.weights.len();
        if n == 0 {
            return;
        }

        let floor = self.floor;
        let total: f32 = self.weights.values().sum();
        if n as f32 * floor >= 1.0 || total <= 0.0 || !total.is_finite() {
            let uniform = 1.0 / n as f32;
            self.weights.values_mut().for_each(|w| *w = uniform);
            return;
        }

        if (total - 1.0).abs() > f32::EPSILON {
            self.weights.values_mut().for_each(|w| *w /= total);
        }

        let mut pinned: Vec<PredictorSource> = Vec::new();
        loop {
            let low: Vec<PredictorSource> = self
                .weights
                .iter()
                .filter(|(s, w)| **w < floor && !pinned.contains(*s))
                .map(|(s, _)| *s)
                .collect();
            if low.is_empty() {
                return;
            }
            pinned.extend(low);

            let free_mass = 1.0 - pinned.len() as f32 * floor;
            let free_total: f32 = self
                .weights
                .iter()
                .filter(|(s, _)| !pinned.contains(*s))
                .map(|(_, w)| *w)
                .sum();
            let unpinned = n - pinned.len();

            for (source, w) in self.weights.iter_mut() {
                if pinned.contains(source) {
                    *w = floor;
                } else if free_total > 0.0 {
                    *w *= free_mass / free_total;
                } else {
                    *w = free_mass / unpinned as f32;
                }
            }
        }
    }
}

// ============================================================================
// FUSION
// ============================================================================

/// One source's contribution to a frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourcePrediction {
    pub source: PredictorSource,
    pub position: Vec2,
    pub velocity: Vec2,
    pub confidence: f32,
    /// The source errored and was replaced by the agent's position
    pub failed: bool,
}

impl SourcePrediction {
    /// Stand-in for a source that could not produce a result
    pub fn failed(source: PredictorSource, position: Vec2) -> Self {
        Self {
            source,
            position,
            velocity: Vec2::ZERO,
            confidence: 0.0,
            failed: true,
        }
    }
}

/// Fused estimate before horizon projection
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fusion {
    pub position: Vec2,
    pub velocity: Vec2,
    pub confidence: f32,
    /// No source contributed
    pub fallback: bool,
}

/// Combine predictions under `weights`
pub fn fuse(
    weights: &EnsembleWeights,
    predictions: &[SourcePrediction],
    fallback_position: Vec2,
    fallback_confidence: f32,
) -> Fusion {
    let contributing: Vec<(&SourcePrediction, f32)> = predictions
        .iter()
        .map(|p| (p, weights.get(p.source) * p.confidence.max(0.0)))
        .filter(|(_, w)| *w > 0.0 && w.is_finite())
        .collect();

    match contributing.as_slice() {
        [] => Fusion {
            position: fallback_position,
            velocity: Vec2::ZERO,
            confidence: fallback_confidence,
            fallback: true,
        },
        [(only, _)] => Fusion {
            position: only.position,
            velocity: only.velocity,
            confidence: only.confidence,
            fallback: false,
        },
        many => {
            let total: f32 = many.iter().map(|(_, w)| w).sum();
            let mut position = Vec2::ZERO;
            let mut velocity = Vec2::ZERO;
            let mut confidence = 0.0;
            for (p, w) in many {
                let share = w / total;
                position = position + p.position.scale(share);
                velocity = velocity + p.velocity.scale(share);
                confidence += p.confidence * share;
            }
            Fusion {
                position,
                velocity,
                confidence: confidence.clamp(0.0, 1.0),
                fallback: false,
            }
        }
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// Rule for adapting ensemble weights after each fused prediction
pub trait FusionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Update `weights` given this frame's predictions
    fn adapt(&self, weights: &mut EnsembleWeights, predictions: &[SourcePrediction]);
}

/// Priors never move
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedWeights;

impl FusionStrategy for FixedWeights {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn adapt(&self, _weights: &mut EnsembleWeights, _predictions: &[SourcePrediction]) {}
}

/// Move each weight a step toward its share of total confidence
#[derive(Clone, Copy, Debug)]
pub struct ConfidenceNudge {
    pub rate: f32,
}

impl FusionStrategy for ConfidenceNudge {
    fn name(&self) -> &'static str {
        "confidence_nudge"
    }

    fn adapt(&self, weights: &mut EnsembleWeights, predictions: &[SourcePrediction]) {
        let total: f32 = predictions.iter().map(|p| p.confidence.max(0.0)).sum();
        if total <= 0.0 || !total.is_finite() {
            return;
        }

        let rate = self.rate.clamp(0.0, 1.0);
        for p in predictions {
            let share = p.confidence.max(0.0) / total;
            let current = weights.get(p.source);
            weights.set_raw(p.source, current + rate * (share - current));
        }
        weights.normalize();
    }
}

/// Strategy for a configured policy
pub fn strategy_for(policy: &FusionPolicy) -> Box<dyn FusionStrategy> {
    match policy {
        FusionPolicy::Fixed => Box::new(FixedWeights),
        FusionPolicy::ConfidenceNudge { rate } => Box::new(ConfidenceNudge { rate: *rate }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_weights() -> EnsembleWeights {
        EnsembleWeights::new(
            [(PredictorSource::Neural, 0.7), (PredictorSource::Knn, 0.3)],
            0.01,
        )
    }

    fn prediction(source: PredictorSource, x: f32, confidence: f32) -> SourcePrediction {
        SourcePrediction {
            source,
            position: Vec2::new(x, x * 2.0),
            velocity: Vec2::new(0.1 * x, -0.3),
            confidence,
            failed: false,
        }
    }

    #[test]
    fn test_weights_sum_to_one_with_floor() {
        let weights = EnsembleWeights::new(
            [(PredictorSource::Neural, 1.0), (PredictorSource::Knn, 0.0)],
            0.01,
        );
        let sum: f32 = weights.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(weights.get(PredictorSource::Knn) >= 0.01);
    }

    #[test]
    fn test_default_priors_are_kept() {
        let weights = default_weights();
        assert!((weights.get(PredictorSource::Neural) - 0.7).abs() < 1e-6);
        assert!((weights.get(PredictorSource::Knn) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_unnormalized_priors_keep_their_ratio() {
        let weights = EnsembleWeights::new(
            [(PredictorSource::Neural, 7.0), (PredictorSource::Knn, 3.0)],
            0.01,
        );
        assert!((weights.get(PredictorSource::Neural) - 0.7).abs() < 1e-6);
        assert!((weights.get(PredictorSource::Knn) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_floor_takes_shortfall_proportionally() {
        let weights = EnsembleWeights::new(
            [(PredictorSource::Neural, 0.999), (PredictorSource::Knn, 0.001)],
            0.05,
        );
        assert!((weights.get(PredictorSource::Knn) - 0.05).abs() < 1e-6);
        assert!((weights.get(PredictorSource::Neural) - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_single_confident_source_passes_through_exactly() {
        let weights = default_weights();
        let predictions = [
            prediction(PredictorSource::Neural, 13.37, 0.0),
            prediction(PredictorSource::Knn, 4.2, 0.35),
        ];
        let fused = fuse(&weights, &predictions, Vec2::ZERO, 0.01);
        assert_eq!(fused.position, predictions[1].position);
        assert_eq!(fused.velocity, predictions[1].velocity);
        assert_eq!(fused.confidence, 0.35);
        assert!(!fused.fallback);
    }

    #[test]
    fn test_weighted_average() {
        let weights = default_weights();
        let predictions = [
            prediction(PredictorSource::Neural, 10.0, 1.0),
            prediction(PredictorSource::Knn, 0.0, 1.0),
        ];
        let fused = fuse(&weights, &predictions, Vec2::ZERO, 0.01);
        assert!((fused.position.x - 7.0).abs() < 1e-4);
    }

    #[test]
    fn test_total_failure_falls_back() {
        let weights = default_weights();
        let here = Vec2::new(5.0, 6.0);
        let predictions = [
            SourcePrediction::failed(PredictorSource::Neural, here),
            SourcePrediction::failed(PredictorSource::Knn, here),
        ];
        let fused = fuse(&weights, &predictions, here, 0.01);
        assert!(fused.fallback);
        assert_eq!(fused.position, here);
        assert_eq!(fused.confidence, 0.01);
    }

    #[test]
    fn test_fixed_strategy_is_inert() {
        let mut weights = default_weights();
        let before = weights.clone();
        strategy_for(&FusionPolicy::Fixed).adapt(
            &mut weights,
            &[prediction(PredictorSource::Knn, 1.0, 1.0)],
        );
        assert_eq!(weights, before);
    }

    #[test]
    fn test_nudge_moves_toward_confident_source() {
        let mut weights = default_weights();
        let strategy = strategy_for(&FusionPolicy::ConfidenceNudge { rate: 0.5 });
        assert_eq!(strategy.name(), "confidence_nudge");

        let predictions = [
            prediction(PredictorSource::Neural, 1.0, 0.0),
            prediction(PredictorSource::Knn, 1.0, 1.0),
        ];
        for _ in 0..50 {
            strategy.adapt(&mut weights, &predictions);
        }

        assert!(weights.get(PredictorSource::Knn) > 0.9);
        assert!(weights.get(PredictorSource::Neural) >= 0.01);
        let sum: f32 = weights.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}
