//! # Predictor - The Movement Prediction Orchestrator
//!
//! `MovementPredictor` owns every model and is the only API the host
//! simulation talks to:
//!
//! ```text
//!               ┌──────────────► PatternClassifier ──► classify_motion
//! histories ──► FeatureExtractor ──┬─► Networks ──┐
//!                                  └─► KNN ───────┴─► fuse ──► predict_position
//!                                                          └─► classify_pattern
//! outcomes ──► add_training_data ──► queue ──(20)──► train (inline | worker)
//! ```
//!
//! Nothing here is fatal to the caller. A model that errors is replaced by
//! the agent's current position at zero confidence, and if nothing is left
//! the agent's position comes back with minimal confidence.

use std::sync::Arc;

use oracle_compute::{KnnPredictor, KnnStats};
use oracle_core::config::TrainingMode;
use oracle_core::{
    AgentState, Clock, FeatureExtractor, FeatureVector, InputHistory, MotionHistory,
    OracleConfig, OracleResult, Pattern, SystemClock, Vec2, FEATURE_DIMS, PATTERN_CLASSES,
};

use crate::accuracy::{AccuracyStats, AccuracyTracker};
use crate::classifier::{PatternClassifier, PatternEstimate};
use crate::ensemble::{
    fuse, strategy_for, EnsembleWeights, FusionStrategy, PredictorSource, SourcePrediction,
};
use crate::trainer::{
    train_batch, BatchReport, Models, TrainedModels, TrainingExample, TrainingWorker,
};

/// What actually happened after a prediction, fed back for training
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub position: Vec2,
    /// Velocity in pixels per frame
    pub velocity: Vec2,
    pub pattern: Pattern,
}

/// Fused position forecast
#[derive(Clone, Debug, PartialEq)]
pub struct PositionPrediction {
    /// Next-frame estimate projected a further `horizon` seconds
    pub position: Vec2,
    pub velocity: Vec2,
    pub confidence: f32,
    pub horizon: f32,
    /// Per-source outputs, before fusion
    pub sources: Vec<SourcePrediction>,
    /// Every source failed or had zero confidence
    pub fallback: bool,
}

/// Which path produced a pattern call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternSource {
    Neural,
    Knn,
    Hybrid,
    /// Neither model had anything to say
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternPrediction {
    pub pattern: Pattern,
    pub confidence: f32,
    pub source: PatternSource,
    /// Network softmax output (all zero if unavailable)
    pub probabilities: [f32; PATTERN_CLASSES],
}

/// Diagnostics
#[derive(Clone, Debug, PartialEq)]
pub struct PredictorStats {
    pub queued: usize,
    pub knn: KnnStats,
    pub accuracy: AccuracyStats,
    pub weights: Vec<(PredictorSource, f32)>,
    pub neural_confidence: f32,
    pub training_passes: u64,
    pub training_in_flight: bool,
    pub last_report: Option<BatchReport>,
    pub parameters: usize,
}

pub struct MovementPredictor {
    pub(crate) config: OracleConfig,
    extractor: FeatureExtractor,
    classifier: PatternClassifier,
    pub(crate) models: Models,
    pub(crate) knn: KnnPredictor<Pattern>,
    pub(crate) weights: EnsembleWeights,
    strategy: Box<dyn FusionStrategy>,
    pub(crate) accuracy: AccuracyTracker,
    pub(crate) queue: Vec<TrainingExample>,
    worker: Option<TrainingWorker>,
    clock: Arc<dyn Clock>,
    pub(crate) training_passes: u64,
    last_report: Option<BatchReport>,
}

impl MovementPredictor {
    /// Create a predictor timestamped by the system clock
    pub fn new(config: OracleConfig) -> OracleResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: OracleConfig, clock: Arc<dyn Clock>) -> OracleResult<Self> {
        config.validate()?;
        let models = Models::new(&config.network)?;
        Self::assemble(config, models, clock)
    }

    /// Wire up everything around an existing model set
    pub(crate) fn assemble(
        config: OracleConfig,
        models: Models,
        clock: Arc<dyn Clock>,
    ) -> OracleResult<Self> {
        let worker = match config.training.mode {
            TrainingMode::Background => Some(TrainingWorker::spawn(config.training.clone())?),
            TrainingMode::Inline => None,
        };

        let weights = EnsembleWeights::new(
            [
                (PredictorSource::Neural, config.ensemble.neural_weight),
                (PredictorSource::Knn, config.ensemble.knn_weight),
            ],
            config.ensemble.weight_floor,
        );

        tracing::info!(
            "Movement predictor ready: {} parameters, {:?} training, {} clock",
            models.parameter_count(),
            config.training.mode,
            clock.name()
        );

        Ok(Self {
            extractor: FeatureExtractor::new(config.features.clone()),
            classifier: PatternClassifier::new(config.classifier.clone()),
            knn: KnnPredictor::new(config.knn.clone(), FEATURE_DIMS),
            strategy: strategy_for(&config.ensemble.policy),
            accuracy: AccuracyTracker::new(),
            queue: Vec::new(),
            training_passes: 0,
            last_report: None,
            models,
            weights,
            worker,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn weights(&self) -> &EnsembleWeights {
        &self.weights
    }

    pub fn knn(&self) -> &KnnPredictor<Pattern> {
        &self.knn
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn training_passes(&self) -> u64 {
        self.training_passes
    }

    pub fn extract_features(
        &self,
        input: &InputHistory,
        motion: &MotionHistory,
        agent: &AgentState,
    ) -> FeatureVector {
        self.extractor.extract(input, motion, agent)
    }

    // ========================================================================
    // TRAINING
    // ========================================================================

    /// Record a realized outcome. The example always goes into the KNN store;
    /// once the queue reaches the trigger size a training pass starts.
    ///
    /// Returns true if this call started a pass.
    pub fn add_training_data(
        &mut self,
        input: &InputHistory,
        motion: &MotionHistory,
        agent: &AgentState,
        outcome: &Observation,
    ) -> OracleResult<bool> {
        self.poll_training();

        let features = self.extractor.extract(input, motion, agent);
        let offset = outcome.position - agent.position;
        let now = self.clock.now();

        self.knn.add(
            features.as_slice().to_vec(),
            outcome.pattern,
            vec![offset.x, offset.y, outcome.velocity.x, outcome.velocity.y],
            1.0,
            now,
        )?;

        let pscale = self.config.network.position_target_scale;
        let vscale = self.config.network.velocity_target_scale;
        self.queue.push(TrainingExample {
            features,
            position_target: [offset.x / pscale, offset.y / pscale],
            velocity_target: [outcome.velocity.x / vscale, outcome.velocity.y / vscale],
            pattern_target: outcome.pattern.one_hot(),
            timestamp: now,
        });

        if self.queue.len() < self.config.training.batch_trigger {
            return Ok(false);
        }
        self.start_training()?;
        Ok(true)
    }

    fn start_training(&mut self) -> OracleResult<()> {
        let batch = std::mem::take(&mut self.queue);
        tracing::debug!("Incremental training on {} examples", batch.len());

        if let Some(worker) = self.worker.as_mut() {
            worker.submit(self.models.clone(), batch);
            return Ok(());
        }

        let report = train_batch(&mut self.models, &batch, &self.config.training, || false)?;
        self.finish_pass(report);
        Ok(())
    }

    fn finish_pass(&mut self, report: BatchReport) {
        self.training_passes += 1;
        tracing::info!(
            "Training pass {} done: {} examples, position loss {:?}",
            self.training_passes,
            report.examples,
            report.position_loss
        );
        self.last_report = Some(report);
    }

    /// Swap in models from a finished background pass, if any
    pub fn poll_training(&mut self) -> bool {
        let Some(result) = self.worker.as_mut().and_then(TrainingWorker::try_collect) else {
            return false;
        };
        self.apply_training(result.outcome)
    }

    /// Block until the in-flight background pass (if any) is applied.
    /// Not for use inside an async runtime.
    pub fn wait_for_training(&mut self) -> bool {
        let Some(result) = self.worker.as_mut().and_then(TrainingWorker::wait) else {
            return false;
        };
        self.apply_training(result.outcome)
    }

    fn apply_training(&mut self, outcome: OracleResult<TrainedModels>) -> bool {
        match outcome {
            Ok(trained) => {
                self.models = trained.models;
                self.finish_pass(trained.report);
                true
            }
            Err(e) => {
                tracing::warn!("Background training failed: {}", e);
                false
            }
        }
    }

    /// Confidence in the regression networks, from their recent loss
    pub fn neural_confidence(&self) -> f32 {
        let e = &self.config.ensemble;
        if !self.models.position.is_trained() {
            return e.untrained_confidence;
        }
        match self.models.position.recent_loss(3) {
            Some(loss) if loss.is_finite() => (-loss * e.loss_sensitivity).exp().clamp(0.0, 1.0),
            _ => e.untrained_confidence,
        }
    }

    // ========================================================================
    // PREDICTION
    // ========================================================================

    /// Forecast the agent's position. The fused estimate is already the
    /// next-frame position; `horizon` seconds project further along the
    /// fused velocity, so 0 gives the next frame.
    pub fn predict_position(
        &mut self,
        input: &InputHistory,
        motion: &MotionHistory,
        agent: &AgentState,
        horizon: f32,
    ) -> PositionPrediction {
        self.poll_training();

        let features = self.extractor.extract(input, motion, agent);
        let sources = vec![
            self.neural_prediction(&features, agent.position),
            self.knn_prediction(&features, agent.position),
        ];

        let fused = fuse(
            &self.weights,
            &sources,
            agent.position,
            self.config.ensemble.fallback_confidence,
        );
        if !fused.fallback {
            self.strategy.adapt(&mut self.weights, &sources);
        }

        let frames = horizon * self.config.ensemble.frame_rate;
        PositionPrediction {
            position: fused.position + fused.velocity.scale(frames),
            velocity: fused.velocity,
            confidence: fused.confidence,
            horizon,
            sources,
            fallback: fused.fallback,
        }
    }

    fn neural_prediction(&self, features: &FeatureVector, here: Vec2) -> SourcePrediction {
        let pscale = self.config.network.position_target_scale;
        let vscale = self.config.network.velocity_target_scale;

        let outputs = self
            .models
            .position
            .predict(features.as_slice())
            .and_then(|p| Ok((p, self.models.velocity.predict(features.as_slice())?)));

        match outputs {
            Ok((p, v)) => {
                let position = here + Vec2::new(p[0], p[1]).scale(pscale);
                let velocity = Vec2::new(v[0], v[1]).scale(vscale);
                if position.is_finite() && velocity.is_finite() {
                    SourcePrediction {
                        source: PredictorSource::Neural,
                        position,
                        velocity,
                        confidence: self.neural_confidence(),
                        failed: false,
                    }
                } else {
                    tracing::warn!("Neural prediction is not finite");
                    SourcePrediction::failed(PredictorSource::Neural, here)
                }
            }
            Err(e) => {
                tracing::warn!("Neural prediction failed: {}", e);
                SourcePrediction::failed(PredictorSource::Neural, here)
            }
        }
    }

    fn knn_prediction(&self, features: &FeatureVector, here: Vec2) -> SourcePrediction {
        match self.knn.regress(features.as_slice()) {
            Ok(Some(r)) if r.target.len() >= 4 => {
                let position = here + Vec2::new(r.target[0], r.target[1]);
                let velocity = Vec2::new(r.target[2], r.target[3]);
                if position.is_finite() && velocity.is_finite() {
                    SourcePrediction {
                        source: PredictorSource::Knn,
                        position,
                        velocity,
                        confidence: r.confidence,
                        failed: false,
                    }
                } else {
                    tracing::warn!("KNN prediction is not finite");
                    SourcePrediction::failed(PredictorSource::Knn, here)
                }
            }
            // Empty store: nothing to say, but nothing broke either
            Ok(_) => SourcePrediction {
                failed: false,
                ..SourcePrediction::failed(PredictorSource::Knn, here)
            },
            Err(e) => {
                tracing::warn!("KNN prediction failed: {}", e);
                SourcePrediction::failed(PredictorSource::Knn, here)
            }
        }
    }

    /// Pattern call from the learned models: the network if its softmax
    /// peak is high enough, else KNN if its vote share is, else a
    /// discounted blend of both.
    pub fn classify_pattern(
        &mut self,
        input: &InputHistory,
        motion: &MotionHistory,
        agent: &AgentState,
    ) -> PatternPrediction {
        self.poll_training();

        let features = self.extractor.extract(input, motion, agent);
        let e = &self.config.ensemble;

        let mut probabilities = [0.0; PATTERN_CLASSES];
        match self.models.pattern.predict(features.as_slice()) {
            Ok(probs) => {
                for (slot, p) in probabilities.iter_mut().zip(probs) {
                    *slot = if p.is_finite() { p } else { 0.0 };
                }
            }
            Err(err) => tracing::warn!("Pattern network failed: {}", err),
        }
        let (neural_pattern, peak) = argmax(&probabilities);
        // An untrained network only contributes its probabilities for display
        let peak = if self.models.pattern.is_trained() { peak } else { 0.0 };

        let knn = match self.knn.vote(features.as_slice()) {
            Ok(vote) => vote,
            Err(err) => {
                tracing::warn!("KNN pattern vote failed: {}", err);
                None
            }
        };
        let (knn_pattern, knn_confidence) = knn.map_or((Pattern::Random, 0.0), |v| (v.label, v.confidence));

        if peak > e.neural_peak_threshold {
            return PatternPrediction {
                pattern: neural_pattern,
                confidence: peak,
                source: PatternSource::Neural,
                probabilities,
            };
        }

        if knn_confidence > e.knn_confidence_threshold {
            return PatternPrediction {
                pattern: knn_pattern,
                confidence: knn_confidence,
                source: PatternSource::Knn,
                probabilities,
            };
        }

        let mass = peak + knn_confidence;
        if mass <= 0.0 {
            return PatternPrediction {
                pattern: Pattern::Random,
                confidence: 0.0,
                source: PatternSource::None,
                probabilities,
            };
        }

        let mut combined = [0.0; PATTERN_CLASSES];
        for (i, slot) in combined.iter_mut().enumerate() {
            let knn_vote = if knn_pattern.index() == i { knn_confidence } else { 0.0 };
            *slot = (peak * probabilities[i] + knn_vote) / mass;
        }
        let (pattern, score) = argmax(&combined);

        PatternPrediction {
            pattern,
            confidence: score * e.hybrid_discount,
            source: PatternSource::Hybrid,
            probabilities,
        }
    }

    /// Rule-based pattern call on raw motion; updates `agent`
    pub fn classify_motion(&self, motion: &MotionHistory, agent: &mut AgentState) -> PatternEstimate {
        self.classifier.classify(motion, agent)
    }

    // ========================================================================
    // ACCURACY
    // ========================================================================

    /// Score a position forecast; returns whether it landed within tolerance
    pub fn update_accuracy(&mut self, predicted: Vec2, actual: Vec2, tolerance: f32) -> bool {
        self.accuracy.record_position(predicted, actual, tolerance)
    }

    pub fn update_pattern_accuracy(&mut self, predicted: Pattern, actual: Pattern) -> bool {
        self.accuracy.record_pattern(predicted, actual)
    }

    pub fn accuracy(&self) -> AccuracyStats {
        self.accuracy.stats()
    }

    pub fn stats(&self) -> PredictorStats {
        PredictorStats {
            queued: self.queue.len(),
            knn: self.knn.stats(),
            accuracy: self.accuracy.stats(),
            weights: self.weights.iter().collect(),
            neural_confidence: self.neural_confidence(),
            training_passes: self.training_passes,
            training_in_flight: self.worker.as_ref().is_some_and(TrainingWorker::is_pending),
            last_report: self.last_report.clone(),
            parameters: self.models.parameter_count(),
        }
    }
}

fn argmax(values: &[f32; PATTERN_CLASSES]) -> (Pattern, f32) {
    let mut best = (0, values[0]);
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > best.1 {
            best = (i, *v);
        }
    }
    (Pattern::from_index(best.0).unwrap_or_default(), best.1)
}
