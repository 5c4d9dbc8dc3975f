//! # Persistence - Saving and Restoring a Predictor
//!
//! `PredictorSnapshot` is a plain nested record of everything a predictor
//! has learned: network weights with their optimizer moments and loss
//! history, the KNN store, ensemble weights, accuracy and the pending
//! training queue. Files are bincode; `to_json` gives a readable dump.
//!
//! The format only round-trips within one `ENGINE_FORMAT_VERSION`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use oracle_compute::{KnnPredictor, Network, NetworkSnapshot};
use oracle_core::{Clock, OracleConfig, OracleError, OracleResult, Pattern, ENGINE_FORMAT_VERSION};

use crate::accuracy::AccuracyTracker;
use crate::ensemble::EnsembleWeights;
use crate::predictor::MovementPredictor;
use crate::trainer::{Models, TrainingExample};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredictorSnapshot {
    pub version: u32,
    pub config: OracleConfig,
    pub position: NetworkSnapshot,
    pub velocity: NetworkSnapshot,
    pub pattern: NetworkSnapshot,
    pub knn: KnnPredictor<Pattern>,
    pub weights: EnsembleWeights,
    pub accuracy: AccuracyTracker,
    pub queue: Vec<TrainingExample>,
    pub training_passes: u64,
}

impl PredictorSnapshot {
    /// Write as bincode, creating parent directories
    pub fn save(&self, path: &Path) -> OracleResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = bincode::serialize(self).map_err(|e| OracleError::serialization(e.to_string()))?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn load(path: &Path) -> OracleResult<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn to_bytes(&self) -> OracleResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| OracleError::serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> OracleResult<Self> {
        let snapshot: Self =
            bincode::deserialize(data).map_err(|e| OracleError::serialization(e.to_string()))?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn to_json(&self) -> OracleResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| OracleError::serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> OracleResult<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| OracleError::serialization(e.to_string()))?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    fn check_version(&self) -> OracleResult<()> {
        if self.version != ENGINE_FORMAT_VERSION {
            return Err(OracleError::VersionMismatch {
                found: self.version,
                expected: ENGINE_FORMAT_VERSION,
            });
        }
        Ok(())
    }
}

impl MovementPredictor {
    /// Capture the learned state. A background pass still in flight is not
    /// included; its examples were already taken off the queue.
    pub fn serialize(&self) -> PredictorSnapshot {
        PredictorSnapshot {
            version: ENGINE_FORMAT_VERSION,
            config: self.config.clone(),
            position: self.models.position.snapshot(),
            velocity: self.models.velocity.snapshot(),
            pattern: self.models.pattern.snapshot(),
            knn: self.knn.clone(),
            weights: self.weights.clone(),
            accuracy: self.accuracy.clone(),
            queue: self.queue.clone(),
            training_passes: self.training_passes,
        }
    }

    /// Rebuild a predictor; network shapes are checked against their specs
    pub fn deserialize(snapshot: PredictorSnapshot, clock: Arc<dyn Clock>) -> OracleResult<Self> {
        snapshot.check_version()?;
        snapshot.config.validate()?;

        let seed = snapshot.config.network.seed;
        let models = Models {
            position: Network::from_snapshot(snapshot.position, seed)?,
            velocity: Network::from_snapshot(snapshot.velocity, seed.map(|s| s.wrapping_add(1)))?,
            pattern: Network::from_snapshot(snapshot.pattern, seed.map(|s| s.wrapping_add(2)))?,
        };

        let mut predictor = Self::assemble(snapshot.config, models, clock)?;
        predictor.knn = snapshot.knn;
        predictor.weights = snapshot.weights;
        predictor.accuracy = snapshot.accuracy;
        predictor.queue = snapshot.queue;
        predictor.training_passes = snapshot.training_passes;
        Ok(predictor)
    }

    pub fn save(&self, path: &Path) -> OracleResult<()> {
        self.serialize().save(path)
    }

    /// Load from `path`, or start fresh from `config` if the file is missing
    /// or unreadable
    pub fn load_or_create(
        path: &Path,
        config: OracleConfig,
        clock: Arc<dyn Clock>,
    ) -> OracleResult<Self> {
        if path.exists() {
            match PredictorSnapshot::load(path) {
                Ok(snapshot) => {
                    let examples = snapshot.knn.len();
                    match Self::deserialize(snapshot, Arc::clone(&clock)) {
                        Ok(predictor) => {
                            tracing::info!(
                                "Predictor loaded: {} KNN records, {} training passes",
                                examples,
                                predictor.training_passes()
                            );
                            return Ok(predictor);
                        }
                        Err(e) => tracing::warn!("Saved predictor rejected, starting fresh: {}", e),
                    }
                }
                Err(e) => tracing::warn!("Cannot read saved predictor, starting fresh: {}", e),
            }
        }

        tracing::info!("Creating new predictor");
        Self::with_clock(config, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::Observation;
    use oracle_core::{AgentState, DirectionKey, InputHistory, LogicalClock, MotionHistory, Vec2};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(LogicalClock::new(0))
    }

    fn trained_predictor() -> (MovementPredictor, InputHistory, MotionHistory, AgentState) {
        let mut predictor =
            MovementPredictor::with_clock(OracleConfig::deterministic(3), clock()).unwrap();

        let mut input = InputHistory::default();
        let mut motion = MotionHistory::default();
        for t in 0..25u64 {
            input.record_keys(&[DirectionKey::Down], t * 16);
            let sample = motion.record_position(50.0, t as f32 * 2.5, t * 16);
            let agent = AgentState::at(sample.position());
            let outcome = Observation {
                position: sample.position() + Vec2::new(0.0, 2.5),
                velocity: Vec2::new(0.0, 2.5),
                pattern: Pattern::Straight,
            };
            predictor.add_training_data(&input, &motion, &agent, &outcome).unwrap();
        }
        predictor.update_accuracy(Vec2::ZERO, Vec2::new(1.0, 0.0), 5.0);

        let agent = AgentState::at(motion.latest().unwrap().position());
        (predictor, input, motion, agent)
    }

    #[test]
    fn test_roundtrip_preserves_predictions() {
        let (mut predictor, input, motion, agent) = trained_predictor();
        assert_eq!(predictor.training_passes(), 1);

        let bytes = predictor.serialize().to_bytes().unwrap();
        let snapshot = PredictorSnapshot::from_bytes(&bytes).unwrap();
        let mut restored = MovementPredictor::deserialize(snapshot, clock()).unwrap();

        let a = predictor.predict_position(&input, &motion, &agent, 0.25);
        let b = restored.predict_position(&input, &motion, &agent, 0.25);
        assert!((a.position.x - b.position.x).abs() < 1e-4);
        assert!((a.position.y - b.position.y).abs() < 1e-4);
        assert!((a.confidence - b.confidence).abs() < 1e-6);

        assert_eq!(restored.queued(), 5);
        assert_eq!(restored.knn().len(), 25);
        assert_eq!(restored.accuracy(), predictor.accuracy());
        assert_eq!(restored.weights(), predictor.weights());
    }

    #[test]
    fn test_save_and_load_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("predictor.bin");

        let (predictor, ..) = trained_predictor();
        predictor.save(&path).unwrap();

        let loaded =
            MovementPredictor::load_or_create(&path, OracleConfig::deterministic(3), clock()).unwrap();
        assert_eq!(loaded.training_passes(), 1);
        assert_eq!(loaded.knn().len(), 25);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictor.bin");
        fs::write(&path, b"not a predictor").unwrap();

        let fresh =
            MovementPredictor::load_or_create(&path, OracleConfig::deterministic(3), clock()).unwrap();
        assert_eq!(fresh.training_passes(), 0);
        assert!(fresh.knn().is_empty());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let (predictor, ..) = trained_predictor();
        let mut snapshot = predictor.serialize();
        snapshot.version = ENGINE_FORMAT_VERSION + 1;
        let bytes = snapshot.to_bytes().unwrap();
        assert!(matches!(
            PredictorSnapshot::from_bytes(&bytes),
            Err(OracleError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_json_dump() {
        let (predictor, ..) = trained_predictor();
        let json = predictor.serialize().to_json().unwrap();
        assert!(json.contains("\"position\""));
        let back = PredictorSnapshot::from_json(&json).unwrap();
        assert_eq!(back.knn.len(), 25);
    }
}
