//! # Network - Stacked Dense Layers
//!
//! A `Network` owns its layers, its RNG (init, shuffling, dropout) and its
//! loss history. The shape is fixed at construction; training only moves
//! weight values.
//!
//! ## Modes
//!
//! The caller picks the mode per call: `train*` always runs layers in
//! `Mode::Training`, `predict` always in `Mode::Inference`. There is no
//! mode flag stored on the network, so a prediction can never accidentally
//! apply dropout.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use oracle_core::error::{OracleError, OracleResult};
use oracle_core::ENGINE_FORMAT_VERSION;

use crate::activation::Activation;
use crate::layer::{AdamConfig, DenseLayer, LayerState, Mode};

/// Shape and behavior of one layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub size: usize,
    pub activation: Activation,
    pub dropout: f32,
    pub batch_norm: bool,
}

impl LayerSpec {
    pub fn new(size: usize, activation: Activation) -> Self {
        Self {
            size,
            activation,
            dropout: 0.0,
            batch_norm: false,
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_batch_norm(mut self, enabled: bool) -> Self {
        self.batch_norm = enabled;
        self
    }
}

/// Full architecture of a network
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Name used in logs
    pub name: String,
    pub input_size: usize,
    pub layers: Vec<LayerSpec>,
    pub learning_rate: f32,
    pub adam: AdamConfig,
    /// Epoch losses kept for diagnostics
    pub loss_history_limit: usize,
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>, input_size: usize) -> Self {
        Self {
            name: name.into(),
            input_size,
            layers: Vec::new(),
            learning_rate: 0.001,
            adam: AdamConfig::default(),
            loss_history_limit: 500,
        }
    }

    pub fn layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.size).unwrap_or(0)
    }

    fn validate(&self) -> OracleResult<()> {
        if self.input_size == 0 {
            return Err(OracleError::architecture(format!("{}: input size is zero", self.name)));
        }
        if self.layers.is_empty() {
            return Err(OracleError::architecture(format!("{}: no layers", self.name)));
        }
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.size == 0 {
                return Err(OracleError::architecture(format!("{}: layer {} is empty", self.name, i)));
            }
            if !(0.0..1.0).contains(&layer.dropout) {
                return Err(OracleError::architecture(format!(
                    "{}: layer {} dropout {} outside [0, 1)",
                    self.name, i, layer.dropout
                )));
            }
            if layer.activation == Activation::Softmax && i != last {
                return Err(OracleError::architecture(format!(
                    "{}: softmax is only valid on the final layer",
                    self.name
                )));
            }
        }
        if self.learning_rate <= 0.0 {
            return Err(OracleError::architecture(format!("{}: learning rate must be positive", self.name)));
        }
        Ok(())
    }
}

/// Serializable state of a network, enough for an exact round trip
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub version: u32,
    pub spec: NetworkSpec,
    pub layers: Vec<LayerState>,
    pub loss_history: Vec<f32>,
    pub examples_seen: u64,
}

/// Result of a training run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingReport {
    /// Mean MSE per completed epoch
    pub epoch_losses: Vec<f32>,
    /// Stopped early at a batch boundary
    pub aborted: bool,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Feed-forward network trained with per-example Adam updates
#[derive(Clone, Debug)]
pub struct Network {
    spec: NetworkSpec,
    layers: Vec<DenseLayer>,
    loss_history: Vec<f32>,
    examples_seen: u64,
    rng: StdRng,
}

impl Network {
    /// Build and initialize a network. `seed = None` draws from entropy.
    ///
    /// Batch-norm is never applied to the final layer.
    pub fn new(spec: NetworkSpec, seed: Option<u64>) -> OracleResult<Self> {
        spec.validate()?;

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let last = spec.layers.len() - 1;
        let mut layers = Vec::with_capacity(spec.layers.len());
        let mut fan_in = spec.input_size;
        for (i, layer) in spec.layers.iter().enumerate() {
            let batch_norm = layer.batch_norm && i != last;
            layers.push(DenseLayer::new(
                fan_in,
                layer.size,
                layer.activation,
                layer.dropout,
                batch_norm,
                &mut rng,
            ));
            fan_in = layer.size;
        }

        tracing::debug!(
            "Network '{}' built: {} layers, {} parameters",
            spec.name,
            layers.len(),
            layers.iter().map(DenseLayer::parameter_count).sum::<usize>()
        );

        Ok(Self {
            spec,
            layers,
            loss_history: Vec::new(),
            examples_seen: 0,
            rng,
        })
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn input_size(&self) -> usize {
        self.spec.input_size
    }

    pub fn output_size(&self) -> usize {
        self.spec.output_size()
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub fn loss_history(&self) -> &[f32] {
        &self.loss_history
    }

    /// Examples trained on since construction (persisted)
    pub fn examples_seen(&self) -> u64 {
        self.examples_seen
    }

    pub fn is_trained(&self) -> bool {
        self.examples_seen > 0
    }

    /// Mean of the last `n` epoch losses
    pub fn recent_loss(&self, n: usize) -> Option<f32> {
        let tail = &self.loss_history[self.loss_history.len().saturating_sub(n)..];
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().sum::<f32>() / tail.len() as f32)
        }
    }

    /// Training-mode forward pass; records state for `backward`
    pub fn forward(&mut self, input: &[f32]) -> OracleResult<Vec<f32>> {
        let mut activations = input.to_vec();
        for layer in &mut self.layers {
            activations = layer.forward(&activations, Mode::Training, &mut self.rng)?;
        }
        Ok(activations)
    }

    /// Backpropagate a loss gradient through every layer
    pub fn backward(&mut self, output_grad: &[f32]) -> OracleResult<Vec<f32>> {
        let mut grad = output_grad.to_vec();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad, self.spec.learning_rate, &self.spec.adam)?;
        }
        Ok(grad)
    }

    /// One forward+backward pair; returns the example's MSE
    pub fn train_example(&mut self, input: &[f32], target: &[f32]) -> OracleResult<f32> {
        OracleError::check_width("training target", self.output_size(), target.len())?;

        let output = self.forward(input)?;
        let n = output.len() as f32;
        let mut loss = 0.0;
        let grad: Vec<f32> = output
            .iter()
            .zip(target)
            .map(|(o, t)| {
                let diff = o - t;
                loss += diff * diff;
                2.0 * diff / n
            })
            .collect();

        self.backward(&grad)?;
        self.examples_seen += 1;
        Ok(loss / n)
    }

    /// Train for `epochs` passes over the data
    pub fn train(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
        epochs: usize,
        batch_size: usize,
    ) -> OracleResult<TrainingReport> {
        self.train_until(inputs, targets, epochs, batch_size, || false)
    }

    /// Like `train`, but `should_abort` is checked at every batch boundary.
    /// An interrupted epoch is not added to the loss history.
    pub fn train_until(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
        epochs: usize,
        batch_size: usize,
        should_abort: impl Fn() -> bool,
    ) -> OracleResult<TrainingReport> {
        if inputs.len() != targets.len() {
            return Err(OracleError::training(format!(
                "{}: {} inputs but {} targets",
                self.spec.name,
                inputs.len(),
                targets.len()
            )));
        }

        let mut report = TrainingReport::default();
        if inputs.is_empty() {
            return Ok(report);
        }

        let mut order: Vec<usize> = (0..inputs.len()).collect();
        'epochs: for epoch in 0..epochs {
            order.shuffle(&mut self.rng);

            let mut total = 0.0;
            for batch in order.chunks(batch_size.max(1)) {
                if should_abort() {
                    report.aborted = true;
                    break 'epochs;
                }
                for &i in batch {
                    total += self.train_example(&inputs[i], &targets[i])?;
                }
            }

            let mean = total / inputs.len() as f32;
            self.push_loss(mean);
            report.epoch_losses.push(mean);
            tracing::debug!("Network '{}' epoch {}: loss {:.5}", self.spec.name, epoch, mean);
        }

        Ok(report)
    }

    fn push_loss(&mut self, loss: f32) {
        self.loss_history.push(loss);
        let limit = self.spec.loss_history_limit.max(1);
        if self.loss_history.len() > limit {
            let excess = self.loss_history.len() - limit;
            self.loss_history.drain(..excess);
        }
    }

    /// Inference-mode forward pass. Never mutates the network, so repeated
    /// calls with the same input return identical bits.
    pub fn predict(&self, input: &[f32]) -> OracleResult<Vec<f32>> {
        let mut activations = input.to_vec();
        for layer in &self.layers {
            activations = layer.infer(&activations)?;
        }
        Ok(activations)
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            version: ENGINE_FORMAT_VERSION,
            spec: self.spec.clone(),
            layers: self.layers.iter().map(DenseLayer::state).collect(),
            loss_history: self.loss_history.clone(),
            examples_seen: self.examples_seen,
        }
    }

    /// Rebuild from a snapshot: layers are constructed from the spec first,
    /// then the persisted values are checked against their shapes.
    pub fn from_snapshot(snapshot: NetworkSnapshot, seed: Option<u64>) -> OracleResult<Self> {
        if snapshot.version != ENGINE_FORMAT_VERSION {
            return Err(OracleError::VersionMismatch {
                found: snapshot.version,
                expected: ENGINE_FORMAT_VERSION,
            });
        }

        let mut network = Self::new(snapshot.spec, seed)?;
        OracleError::check_width("restored layers", network.layers.len(), snapshot.layers.len())?;
        for (layer, state) in network.layers.iter_mut().zip(snapshot.layers) {
            layer.restore(state)?;
        }
        network.loss_history = snapshot.loss_history;
        network.examples_seen = snapshot.examples_seen;
        Ok(network)
    }
}
