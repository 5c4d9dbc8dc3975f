//! # ORACLE Brain
//!
//! The movement predictor: watches a mover's recent input and motion,
//! labels its movement style and forecasts where it will be next.
//!
//! This crate provides:
//! - **Classifier**: rule-based circular / zigzag / strafe / straight detection
//! - **Ensemble**: confidence-weighted fusion of the neural and KNN forecasts
//! - **Trainer**: incremental training, inline or on a worker thread
//! - **Predictor**: the orchestrator the host simulation talks to
//! - **Persistence**: bincode snapshots of everything learned
//!
//! ## Configuration
//!
//! `OracleConfig::from_env()` reads `ORACLE_*` overrides; see
//! `oracle_core::config`. Set `ORACLE_BACKGROUND_TRAINING=0` to train on the
//! caller's thread.

pub mod accuracy;
pub mod classifier;
pub mod ensemble;
pub mod persistence;
pub mod predictor;
pub mod sim;
pub mod trainer;

pub use accuracy::{AccuracyStats, AccuracyTracker};
pub use classifier::{PatternClassifier, PatternEstimate, PatternScores};
pub use ensemble::{EnsembleWeights, FusionStrategy, PredictorSource, SourcePrediction};
pub use persistence::PredictorSnapshot;
pub use predictor::{
    MovementPredictor, Observation, PatternPrediction, PatternSource, PositionPrediction,
    PredictorStats,
};
pub use trainer::{BatchReport, TrainingExample, TrainingWorker};
