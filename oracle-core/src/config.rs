//! # Configuration - ORACLE's Tunable Thresholds
//!
//! Every constant the detectors, models and fusion rules depend on lives
//! here, with defaults matching the reference behavior. Load from JSON for
//! experiments, or override a handful of knobs from the environment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OracleError, OracleResult};
use crate::{INPUT_HISTORY_CAPACITY, MOTION_HISTORY_CAPACITY};

/// Master configuration for ORACLE
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// History buffer sizes
    pub history: HistoryConfig,

    /// Feature normalization
    pub features: FeatureConfig,

    /// Heuristic pattern detector thresholds
    pub classifier: ClassifierConfig,

    /// Network shapes and optimizer settings
    pub network: NetworkConfig,

    /// Nearest-neighbor store
    pub knn: KnnConfig,

    /// Fusion and arbitration between predictors
    pub ensemble: EnsembleConfig,

    /// Incremental training schedule
    pub training: TrainingConfig,
}

/// Ring buffer capacities
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub motion_capacity: usize,
    pub input_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            motion_capacity: MOTION_HISTORY_CAPACITY,
            input_capacity: INPUT_HISTORY_CAPACITY,
        }
    }
}

/// Scales used to bring raw kinematics into roughly [-1, 1]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Velocity that maps to 1.0 (px/frame)
    pub velocity_scale: f32,

    /// Acceleration that maps to 1.0 (px/frame²)
    pub acceleration_scale: f32,

    /// Key hold duration that maps to 1.0 (ms)
    pub held_scale_ms: f32,

    /// Direction change count that maps to 1.0
    pub direction_change_scale: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            velocity_scale: 10.0,
            acceleration_scale: 3.0,
            held_scale_ms: 1000.0,
            direction_change_scale: 15.0,
        }
    }
}

/// Heuristic detector thresholds (angles in degrees)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Samples examined per classification
    pub window: usize,

    // === CIRCULAR ===
    pub circular_min_speed: f32,
    pub circular_min_radius: f32,
    pub circular_min_consistency: f32,
    pub circular_min_rotation_deg: f32,
    pub circular_min_sign_agreement: f32,

    // === ZIGZAG ===
    pub zigzag_min_speed: f32,
    pub zigzag_turn_deg: f32,
    pub zigzag_min_change_ratio: f32,
    pub zigzag_min_flip_ratio: f32,

    // === STRAFE ===
    pub strafe_min_speed: f32,
    pub strafe_mean_deviation_deg: f32,
    pub strafe_max_deviation_deg: f32,
    /// Speed variation (std / mean) above which the mover is erratic
    pub strafe_max_speed_variation: f32,

    // === STRAIGHT ===
    pub straight_min_speed: f32,
    pub straight_max_turn_deg: f32,
    pub straight_max_lateral_px: f32,

    /// Speed variation at or below this is steady cruising (straight),
    /// above it a held heading reads as strafing
    pub steady_speed_variation: f32,

    // === HYSTERESIS ===
    /// Top score must exceed this to be adopted
    pub adopt_threshold: f32,
    /// ... and beat the runner-up by more than this
    pub adopt_margin: f32,
    /// Below this everything is random
    pub random_threshold: f32,
    /// Confidence multiplier in the ambiguous band
    pub confidence_decay: f32,

    /// Heading change counted as a direction change
    pub direction_change_deg: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window: 15,
            circular_min_speed: 1.5,
            circular_min_radius: 30.0,
            circular_min_consistency: 0.7,
            circular_min_rotation_deg: 90.0,
            circular_min_sign_agreement: 0.6,
            zigzag_min_speed: 1.5,
            zigzag_turn_deg: 30.0,
            zigzag_min_change_ratio: 0.4,
            zigzag_min_flip_ratio: 0.7,
            strafe_min_speed: 2.0,
            strafe_mean_deviation_deg: 15.0,
            strafe_max_deviation_deg: 30.0,
            strafe_max_speed_variation: 0.5,
            straight_min_speed: 2.0,
            straight_max_turn_deg: 20.0,
            straight_max_lateral_px: 15.0,
            steady_speed_variation: 0.08,
            adopt_threshold: 0.6,
            adopt_margin: 0.2,
            random_threshold: 0.3,
            confidence_decay: 0.9,
            direction_change_deg: 45.0,
        }
    }
}

/// Network shapes and optimizer settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Hidden layer widths of the position and velocity regressors
    pub regression_hidden: Vec<usize>,

    /// Hidden layer widths of the pattern classifier
    pub pattern_hidden: Vec<usize>,

    pub learning_rate: f32,

    /// Dropout on hidden layers (training only)
    pub dropout: f32,

    /// Batch-norm on hidden layers
    pub batch_norm: bool,

    /// Seed for weight init, shuffling and dropout (None = entropy)
    pub seed: Option<u64>,

    /// Displacement (px) that maps to a regression target of 1.0
    pub position_target_scale: f32,

    /// Velocity (px/frame) that maps to a regression target of 1.0
    pub velocity_target_scale: f32,

    /// Epoch losses kept for diagnostics
    pub loss_history_limit: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            regression_hidden: vec![64, 32],
            pattern_hidden: vec![32, 16],
            learning_rate: 0.001,
            dropout: 0.1,
            batch_norm: true,
            seed: None,
            position_target_scale: 50.0,
            velocity_target_scale: 10.0,
            loss_history_limit: 500,
        }
    }
}

/// Distance used by the nearest-neighbor search
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Manhattan,
    /// 1 - cosine similarity
    Cosine,
    /// Euclidean with a per-feature weight (missing weights count as 1)
    WeightedEuclidean { weights: Vec<f32> },
}

impl DistanceMetric {
    /// Parse a metric name (weighted Euclidean needs weights, so it is not
    /// accepted here)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "euclidean" => Some(Self::Euclidean),
            "manhattan" => Some(Self::Manhattan),
            "cosine" => Some(Self::Cosine),
            _ => None,
        }
    }
}

/// Nearest-neighbor store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnnConfig {
    /// Neighbors consulted per query
    pub k: usize,

    /// Records kept before eviction
    pub max_records: usize,

    /// Fraction of `max_records` kept after eviction (newest first)
    pub retain_fraction: f32,

    pub metric: DistanceMetric,

    /// Added to distances before inverting
    pub epsilon: f32,

    /// Store size at which distance scans go parallel
    pub parallel_threshold: usize,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            k: 5,
            max_records: 2000,
            retain_fraction: 0.75,
            metric: DistanceMetric::Euclidean,
            epsilon: 1e-6,
            parallel_threshold: 1024,
        }
    }
}

/// How ensemble weights react to observed confidence
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPolicy {
    /// Weights never move from their configured priors
    #[default]
    Fixed,
    /// Nudge each weight toward its share of total confidence
    ConfidenceNudge { rate: f32 },
}

/// Fusion and arbitration between predictors
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Prior weight of the neural predictor
    pub neural_weight: f32,

    /// Prior weight of the KNN predictor
    pub knn_weight: f32,

    /// No weight may drop below this
    pub weight_floor: f32,

    pub policy: FusionPolicy,

    /// Network softmax peak needed to trust the network's pattern
    pub neural_peak_threshold: f32,

    /// KNN vote share needed to trust the KNN pattern
    pub knn_confidence_threshold: f32,

    /// Confidence multiplier applied to hybrid pattern calls
    pub hybrid_discount: f32,

    /// Simulation frames per second (for horizon projection)
    pub frame_rate: f32,

    /// Confidence reported when every predictor failed
    pub fallback_confidence: f32,

    /// Confidence of a network that has never been trained
    pub untrained_confidence: f32,

    /// How quickly network confidence falls with training loss
    pub loss_sensitivity: f32,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            neural_weight: 0.7,
            knn_weight: 0.3,
            weight_floor: 0.01,
            policy: FusionPolicy::Fixed,
            neural_peak_threshold: 0.8,
            knn_confidence_threshold: 0.7,
            hybrid_discount: 0.8,
            frame_rate: 60.0,
            fallback_confidence: 0.01,
            untrained_confidence: 0.05,
            loss_sensitivity: 10.0,
        }
    }
}

/// Where incremental training runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// On the caller's thread, before `add_training_data` returns
    Inline,
    /// On a worker thread; results are swapped in on a later call
    #[default]
    Background,
}

/// Incremental training schedule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Queued examples that trigger a training pass
    pub batch_trigger: usize,

    /// Epochs per incremental pass
    pub epochs: usize,

    /// Mini-batch size within a pass
    pub batch_size: usize,

    pub mode: TrainingMode,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_trigger: 20,
            epochs: 3,
            batch_size: 5,
            mode: TrainingMode::Background,
        }
    }
}

impl OracleConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> OracleResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| OracleError::serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> OracleResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| OracleError::serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Deterministic config for tests: fixed seed, inline training
    pub fn deterministic(seed: u64) -> Self {
        let mut config = Self::default();
        config.network.seed = Some(seed);
        config.training.mode = TrainingMode::Inline;
        config
    }

    /// Create config from environment variables
    ///
    /// Reads:
    /// - ORACLE_KNN_CAPACITY: max KNN records (default: 2000)
    /// - ORACLE_KNN_K: neighbors per query (default: 5)
    /// - ORACLE_KNN_METRIC: euclidean | manhattan | cosine
    /// - ORACLE_LEARNING_RATE: Adam learning rate (default: 0.001)
    /// - ORACLE_BACKGROUND_TRAINING: "0"/"false" trains inline
    /// - ORACLE_SEED: fixed RNG seed
    /// - ORACLE_FRAME_RATE: frames per second (default: 60)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("ORACLE_KNN_CAPACITY") {
            config.knn.max_records = v;
        }
        if let Some(v) = env_parse("ORACLE_KNN_K") {
            config.knn.k = v;
        }
        if let Ok(name) = std::env::var("ORACLE_KNN_METRIC") {
            match DistanceMetric::from_name(&name) {
                Some(metric) => config.knn.metric = metric,
                None => tracing::warn!("Unknown ORACLE_KNN_METRIC '{}', keeping euclidean", name),
            }
        }
        if let Some(v) = env_parse("ORACLE_LEARNING_RATE") {
            config.network.learning_rate = v;
        }
        if let Ok(val) = std::env::var("ORACLE_BACKGROUND_TRAINING") {
            let background = !(val == "0" || val.eq_ignore_ascii_case("false"));
            config.training.mode = if background {
                TrainingMode::Background
            } else {
                TrainingMode::Inline
            };
        }
        if let Some(v) = env_parse("ORACLE_SEED") {
            config.network.seed = Some(v);
        }
        if let Some(v) = env_parse("ORACLE_FRAME_RATE") {
            config.ensemble.frame_rate = v;
        }

        config
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> OracleResult<()> {
        if self.history.motion_capacity == 0 || self.history.input_capacity == 0 {
            return Err(OracleError::config("history capacities must be positive"));
        }
        if self.classifier.window < 2 {
            return Err(OracleError::config("classifier window needs at least 2 samples"));
        }
        if !(0.0..1.0).contains(&self.network.dropout) {
            return Err(OracleError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.network.dropout
            )));
        }
        if self.network.learning_rate <= 0.0 {
            return Err(OracleError::config("learning rate must be positive"));
        }
        if self.knn.k == 0 || self.knn.max_records == 0 {
            return Err(OracleError::config("knn k and max_records must be positive"));
        }
        if !(self.knn.retain_fraction > 0.0 && self.knn.retain_fraction <= 1.0) {
            return Err(OracleError::config("knn retain_fraction must be in (0, 1]"));
        }
        if self.ensemble.frame_rate <= 0.0 {
            return Err(OracleError::config("frame rate must be positive"));
        }
        if self.ensemble.weight_floor < 0.0 || self.ensemble.weight_floor * 2.0 >= 1.0 {
            return Err(OracleError::config("weight floor must be in [0, 0.5)"));
        }
        if self.training.batch_trigger == 0 || self.training.batch_size == 0 {
            return Err(OracleError::config("training batch sizes must be positive"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OracleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training.batch_trigger, 20);
        assert_eq!(config.ensemble.neural_weight, 0.7);
        assert_eq!(config.ensemble.knn_weight, 0.3);
        assert_eq!(config.classifier.window, 15);
    }

    #[test]
    fn test_validate_rejects_bad_dropout() {
        let mut config = OracleConfig::default();
        config.network.dropout = 1.0;
        assert!(matches!(config.validate(), Err(OracleError::Config(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oracle.json");

        let mut config = OracleConfig::deterministic(7);
        config.knn.metric = DistanceMetric::WeightedEuclidean {
            weights: vec![2.0, 0.5],
        };
        config.ensemble.policy = FusionPolicy::ConfidenceNudge { rate: 0.05 };
        config.save(&path).unwrap();

        let loaded = OracleConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");

        let mut config = OracleConfig::default();
        config.knn.k = 0;
        config.save(&path).unwrap();

        assert!(matches!(OracleConfig::load(&path), Err(OracleError::Config(_))));
    }

    #[test]
    fn test_metric_from_name() {
        assert_eq!(DistanceMetric::from_name("Cosine"), Some(DistanceMetric::Cosine));
        assert_eq!(DistanceMetric::from_name("chebyshev"), None);
    }
}
