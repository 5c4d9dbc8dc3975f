//! # Dense Layer
//!
//! `output = activation(batch_norm(input · W + b))`, with inverted dropout in
//! training mode and an Adam update on every backward pass.
//!
//! A layer remembers exactly one forward pass (input, output, dropout mask).
//! The next `backward` consumes it, so forward and backward for one example
//! must be paired without another forward in between. A `backward` with
//! nothing recorded hands the gradient back unchanged.

use rand::Rng;
use serde::{Deserialize, Serialize};

use oracle_core::error::{OracleError, OracleResult};

use crate::activation::Activation;

/// Whether a forward pass may use dropout and update batch-norm statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// Adam hyper-parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Running-statistics batch normalization
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    pub running_mean: Vec<f32>,
    pub running_var: Vec<f32>,
    pub momentum: f32,
    pub epsilon: f32,
}

impl BatchNorm {
    pub fn new(size: usize) -> Self {
        Self {
            running_mean: vec![0.0; size],
            running_var: vec![1.0; size],
            momentum: 0.9,
            epsilon: 1e-8,
        }
    }

    /// Normalize in place, returning the per-unit scale `1/sqrt(var+ε)`
    /// that the backward pass needs.
    fn normalize(&mut self, values: &mut [f32], mode: Mode) -> Vec<f32> {
        if mode == Mode::Training {
            let m = self.momentum;
            for (j, v) in values.iter().enumerate() {
                self.running_mean[j] = m * self.running_mean[j] + (1.0 - m) * v;
                let centered = v - self.running_mean[j];
                self.running_var[j] = m * self.running_var[j] + (1.0 - m) * centered * centered;
            }
        }
        self.apply(values)
    }

    fn apply(&self, values: &mut [f32]) -> Vec<f32> {
        values
            .iter_mut()
            .enumerate()
            .map(|(j, v)| {
                let scale = 1.0 / (self.running_var[j] + self.epsilon).sqrt();
                *v = (*v - self.running_mean[j]) * scale;
                scale
            })
            .collect()
    }
}

/// Adam first/second moments and step counter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamMoments {
    pub m_weights: Vec<f32>,
    pub v_weights: Vec<f32>,
    pub m_biases: Vec<f32>,
    pub v_biases: Vec<f32>,
    pub step: u64,
}

impl AdamMoments {
    fn new(weights: usize, biases: usize) -> Self {
        Self {
            m_weights: vec![0.0; weights],
            v_weights: vec![0.0; weights],
            m_biases: vec![0.0; biases],
            v_biases: vec![0.0; biases],
            step: 0,
        }
    }
}

/// Everything about a layer that survives serialization
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
    pub batch_norm: Option<BatchNorm>,
    pub moments: AdamMoments,
}

/// The one forward pass a layer remembers
#[derive(Clone, Debug)]
struct ForwardRecord {
    input: Vec<f32>,
    /// Post-activation, pre-dropout
    output: Vec<f32>,
    mask: Option<Vec<f32>>,
    bn_scale: Option<Vec<f32>>,
}

/// Fully connected layer with its own optimizer state
#[derive(Clone, Debug)]
pub struct DenseLayer {
    input_size: usize,
    output_size: usize,
    activation: Activation,
    dropout: f32,
    /// Row-major `input_size × output_size`
    weights: Vec<f32>,
    biases: Vec<f32>,
    batch_norm: Option<BatchNorm>,
    moments: AdamMoments,
    record: Option<ForwardRecord>,
}

impl DenseLayer {
    /// Create a layer with He (ReLU family) or Xavier (others) uniform init
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        output_size: usize,
        activation: Activation,
        dropout: f32,
        batch_norm: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = input_size.max(1) as f32;
        let fan_out = output_size.max(1) as f32;
        let limit = if activation.prefers_he_init() {
            (6.0 / fan_in).sqrt()
        } else {
            (6.0 / (fan_in + fan_out)).sqrt()
        };

        let weights = (0..input_size * output_size)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();

        Self {
            input_size,
            output_size,
            activation,
            dropout,
            weights,
            biases: vec![0.0; output_size],
            batch_norm: batch_norm.then(|| BatchNorm::new(output_size)),
            moments: AdamMoments::new(input_size * output_size, output_size),
            record: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn step(&self) -> u64 {
        self.moments.step
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn affine(&self, input: &[f32]) -> Vec<f32> {
        let mut z = self.biases.clone();
        for (i, &x) in input.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            let row = &self.weights[i * self.output_size..(i + 1) * self.output_size];
            for (zj, w) in z.iter_mut().zip(row) {
                *zj += x * w;
            }
        }
        z
    }

    /// Forward pass that records what `backward` needs
    pub fn forward<R: Rng + ?Sized>(
        &mut self,
        input: &[f32],
        mode: Mode,
        rng: &mut R,
    ) -> OracleResult<Vec<f32>> {
        OracleError::check_width("layer input", self.input_size, input.len())?;

        let mut z = self.affine(input);
        let bn_scale = self
            .batch_norm
            .as_mut()
            .map(|bn| bn.normalize(&mut z, mode));
        self.activation.apply(&mut z);
        let output = z.clone();

        let mask = if mode == Mode::Training && self.dropout > 0.0 {
            let keep = 1.0 / (1.0 - self.dropout);
            let mask: Vec<f32> = (0..self.output_size)
                .map(|_| if rng.gen::<f32>() < self.dropout { 0.0 } else { keep })
                .collect();
            z.iter_mut().zip(&mask).for_each(|(v, m)| *v *= m);
            Some(mask)
        } else {
            None
        };

        self.record = Some(ForwardRecord {
            input: input.to_vec(),
            output,
            mask,
            bn_scale,
        });

        Ok(z)
    }

    /// Inference-only forward pass: no dropout, no statistics update, no record
    pub fn infer(&self, input: &[f32]) -> OracleResult<Vec<f32>> {
        OracleError::check_width("layer input", self.input_size, input.len())?;

        let mut z = self.affine(input);
        if let Some(bn) = &self.batch_norm {
            bn.apply(&mut z);
        }
        self.activation.apply(&mut z);
        Ok(z)
    }

    /// Backpropagate `output_grad`, update parameters with Adam, and return
    /// the gradient for the previous layer.
    pub fn backward(
        &mut self,
        output_grad: &[f32],
        learning_rate: f32,
        adam: &AdamConfig,
    ) -> OracleResult<Vec<f32>> {
        let Some(record) = self.record.take() else {
            return Ok(output_grad.to_vec());
        };
        OracleError::check_width("layer gradient", self.output_size, output_grad.len())?;

        let delta: Vec<f32> = (0..self.output_size)
            .map(|j| {
                let mut d = output_grad[j] * self.activation.derivative(record.output[j]);
                if let Some(mask) = &record.mask {
                    d *= mask[j];
                }
                if let Some(scale) = &record.bn_scale {
                    d *= scale[j];
                }
                d
            })
            .collect();

        let input_grad: Vec<f32> = (0..self.input_size)
            .map(|i| {
                let row = &self.weights[i * self.output_size..(i + 1) * self.output_size];
                row.iter().zip(&delta).map(|(w, d)| w * d).sum()
            })
            .collect();

        self.moments.step += 1;
        let t = self.moments.step.min(i32::MAX as u64) as i32;
        let correction1 = 1.0 - adam.beta1.powi(t);
        let correction2 = 1.0 - adam.beta2.powi(t);

        let step_size = |m: &mut f32, v: &mut f32, g: f32| -> f32 {
            *m = adam.beta1 * *m + (1.0 - adam.beta1) * g;
            *v = adam.beta2 * *v + (1.0 - adam.beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            learning_rate * m_hat / (v_hat.sqrt() + adam.epsilon)
        };

        for (i, &x) in record.input.iter().enumerate() {
            for (j, &d) in delta.iter().enumerate() {
                let idx = i * self.output_size + j;
                let update = step_size(
                    &mut self.moments.m_weights[idx],
                    &mut self.moments.v_weights[idx],
                    x * d,
                );
                self.weights[idx] -= update;
            }
        }

        for (j, &d) in delta.iter().enumerate() {
            let update = step_size(
                &mut self.moments.m_biases[j],
                &mut self.moments.v_biases[j],
                d,
            );
            self.biases[j] -= update;
        }

        Ok(input_grad)
    }

    pub fn state(&self) -> LayerState {
        LayerState {
            weights: self.weights.clone(),
            biases: self.biases.clone(),
            batch_norm: self.batch_norm.clone(),
            moments: self.moments.clone(),
        }
    }

    /// Restore persisted values into a layer of the same shape
    pub fn restore(&mut self, state: LayerState) -> OracleResult<()> {
        let weights = self.input_size * self.output_size;
        OracleError::check_width("restored weights", weights, state.weights.len())?;
        OracleError::check_width("restored biases", self.output_size, state.biases.len())?;
        OracleError::check_width("restored weight moments", weights, state.moments.m_weights.len())?;
        OracleError::check_width("restored weight moments", weights, state.moments.v_weights.len())?;
        OracleError::check_width("restored bias moments", self.output_size, state.moments.m_biases.len())?;
        OracleError::check_width("restored bias moments", self.output_size, state.moments.v_biases.len())?;

        match (&self.batch_norm, &state.batch_norm) {
            (Some(_), Some(bn)) => {
                OracleError::check_width("restored batch-norm", self.output_size, bn.running_mean.len())?;
                OracleError::check_width("restored batch-norm", self.output_size, bn.running_var.len())?;
            }
            (None, None) => {}
            _ => {
                return Err(OracleError::architecture(
                    "batch-norm presence differs from the persisted layer",
                ))
            }
        }

        self.weights = state.weights;
        self.biases = state.biases;
        self.batch_norm = state.batch_norm;
        self.moments = state.moments;
        self.record = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layer(activation: Activation, dropout: f32, batch_norm: bool) -> (DenseLayer, StdRng) {
        let mut rng = StdRng::seed_from_u64(11);
        let layer = DenseLayer::new(3, 2, activation, dropout, batch_norm, &mut rng);
        (layer, rng)
    }

    #[test]
    fn test_width_mismatch_fails_fast() {
        let (mut layer, mut rng) = layer(Activation::Relu, 0.0, false);
        let err = layer.forward(&[1.0, 2.0], Mode::Training, &mut rng);
        assert!(matches!(err, Err(OracleError::ShapeMismatch { expected: 3, actual: 2, .. })));
        assert!(layer.infer(&[1.0; 4]).is_err());
    }

    #[test]
    fn test_backward_without_forward_is_passthrough() {
        let (mut layer, _) = layer(Activation::Tanh, 0.0, false);
        let before = layer.state();
        let grad = layer.backward(&[0.5, -0.5], 0.01, &AdamConfig::default()).unwrap();
        assert_eq!(grad, vec![0.5, -0.5]);
        assert_eq!(layer.state(), before, "no update without a recorded forward");
        assert_eq!(layer.step(), 0);
    }

    #[test]
    fn test_backward_consumes_record() {
        let (mut layer, mut rng) = layer(Activation::Identity, 0.0, false);
        layer.forward(&[1.0, 0.5, -1.0], Mode::Training, &mut rng).unwrap();
        let grad = layer.backward(&[1.0, 1.0], 0.01, &AdamConfig::default()).unwrap();
        assert_eq!(grad.len(), 3);
        assert_eq!(layer.step(), 1);

        // Second backward has nothing to pair with
        let passthrough = layer.backward(&[1.0, 1.0], 0.01, &AdamConfig::default()).unwrap();
        assert_eq!(passthrough, vec![1.0, 1.0]);
        assert_eq!(layer.step(), 1);
    }

    #[test]
    fn test_dropout_only_in_training() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = DenseLayer::new(4, 64, Activation::Sigmoid, 0.5, false, &mut rng);
        let input = [0.2, -0.1, 0.4, 0.3];

        let trained = layer.forward(&input, Mode::Training, &mut rng).unwrap();
        let zeros = trained.iter().filter(|v| **v == 0.0).count();
        assert!(zeros > 0 && zeros < 64, "some units dropped, got {zeros}");

        let inferred = layer.infer(&input).unwrap();
        assert!(inferred.iter().all(|v| *v > 0.0), "sigmoid never reaches zero");

        // Survivors are scaled by 1/(1-p)
        for (t, i) in trained.iter().zip(&inferred) {
            if *t != 0.0 {
                assert!((t - i * 2.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_adam_reduces_error() {
        let (mut layer, mut rng) = layer(Activation::Identity, 0.0, false);
        let input = [0.5, -0.3, 0.8];
        let target = [1.0, -1.0];
        let adam = AdamConfig::default();

        let error = |out: &[f32]| -> f32 {
            out.iter().zip(&target).map(|(o, t)| (o - t).powi(2)).sum()
        };
        let initial = error(&layer.infer(&input).unwrap());

        for _ in 0..200 {
            let out = layer.forward(&input, Mode::Training, &mut rng).unwrap();
            let grad: Vec<f32> = out.iter().zip(&target).map(|(o, t)| 2.0 * (o - t)).collect();
            layer.backward(&grad, 0.01, &adam).unwrap();
        }

        let trained = error(&layer.infer(&input).unwrap());
        assert!(trained < initial * 0.1, "{initial} -> {trained}");
    }

    #[test]
    fn test_batch_norm_statistics_move_only_in_training() {
        let (mut layer, mut rng) = layer(Activation::Relu, 0.0, true);
        let before = layer.state().batch_norm.unwrap();

        layer.forward(&[1.0, 2.0, 3.0], Mode::Inference, &mut rng).unwrap();
        assert_eq!(layer.state().batch_norm.unwrap(), before);

        layer.forward(&[1.0, 2.0, 3.0], Mode::Training, &mut rng).unwrap();
        assert_ne!(layer.state().batch_norm.unwrap(), before);
    }

    #[test]
    fn test_restore_checks_shape() {
        let (mut a, _) = layer(Activation::Relu, 0.0, false);
        let mut rng = StdRng::seed_from_u64(5);
        let b = DenseLayer::new(4, 2, Activation::Relu, 0.0, false, &mut rng);
        assert!(a.restore(b.state()).is_err());

        let (c, _) = layer(Activation::Relu, 0.0, true);
        assert!(a.restore(c.state()).is_err(), "batch-norm presence must match");
    }
}
