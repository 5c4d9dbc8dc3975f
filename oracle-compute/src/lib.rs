//! # ORACLE Compute
//!
//! Learning engines for ORACLE's movement predictor.
//!
//! This crate provides two engines:
//! - **Network**: hand-rolled dense layers (dropout, batch-norm, Adam) stacked
//!   into feed-forward networks
//! - **KNN**: a bounded, distance-weighted nearest-neighbor store
//!
//! ## Model Shapes
//!
//! Regression networks end in an identity layer, the pattern network in a
//! softmax over the pattern classes. Both are built from `NetworkConfig`
//! via `regression_spec` / `classifier_spec`.

pub mod activation;
pub mod knn;
pub mod layer;
pub mod network;

pub use activation::Activation;
pub use knn::{distance, KnnPredictor, KnnRecord, KnnStats, Neighbor, Regression, Vote};
pub use layer::{AdamConfig, DenseLayer, LayerState, Mode};
pub use network::{LayerSpec, Network, NetworkSnapshot, NetworkSpec, TrainingReport};

use oracle_core::config::NetworkConfig;

fn hidden_stack(
    spec: NetworkSpec,
    hidden: &[usize],
    config: &NetworkConfig,
) -> NetworkSpec {
    hidden.iter().fold(spec, |spec, &size| {
        spec.layer(
            LayerSpec::new(size, Activation::Relu)
                .with_dropout(config.dropout)
                .with_batch_norm(config.batch_norm),
        )
    })
}

/// ReLU hidden stack ending in `outputs` identity units
pub fn regression_spec(
    name: &str,
    input_size: usize,
    outputs: usize,
    config: &NetworkConfig,
) -> NetworkSpec {
    let mut spec = NetworkSpec::new(name, input_size).learning_rate(config.learning_rate);
    spec.loss_history_limit = config.loss_history_limit;
    hidden_stack(spec, &config.regression_hidden, config)
        .layer(LayerSpec::new(outputs, Activation::Identity))
}

/// ReLU hidden stack ending in a softmax over `classes`
pub fn classifier_spec(
    name: &str,
    input_size: usize,
    classes: usize,
    config: &NetworkConfig,
) -> NetworkSpec {
    let mut spec = NetworkSpec::new(name, input_size).learning_rate(config.learning_rate);
    spec.loss_history_limit = config.loss_history_limit;
    hidden_stack(spec, &config.pattern_hidden, config)
        .layer(LayerSpec::new(classes, Activation::Softmax))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_core::{FEATURE_DIMS, PATTERN_CLASSES};

    #[test]
    fn test_default_shapes() {
        let config = NetworkConfig::default();

        let position = regression_spec("position", FEATURE_DIMS, 2, &config);
        let sizes: Vec<usize> = position.layers.iter().map(|l| l.size).collect();
        assert_eq!(sizes, vec![64, 32, 2]);
        assert_eq!(position.layers[2].activation, Activation::Identity);

        let pattern = classifier_spec("pattern", FEATURE_DIMS, PATTERN_CLASSES, &config);
        let sizes: Vec<usize> = pattern.layers.iter().map(|l| l.size).collect();
        assert_eq!(sizes, vec![32, 16, 5]);
        assert_eq!(pattern.layers[2].activation, Activation::Softmax);
    }

    #[test]
    fn test_classifier_outputs_distribution() {
        let config = NetworkConfig::default();
        let spec = classifier_spec("pattern", FEATURE_DIMS, PATTERN_CLASSES, &config);
        let network = Network::new(spec, Some(3)).unwrap();
        let probs = network.predict(&vec![0.5; FEATURE_DIMS]).unwrap();
        assert_eq!(probs.len(), PATTERN_CLASSES);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
