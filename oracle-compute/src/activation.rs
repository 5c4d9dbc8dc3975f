//! Activation functions for dense layers.

use serde::{Deserialize, Serialize};

/// Slope of leaky ReLU for negative inputs
pub const LEAKY_SLOPE: f32 = 0.01;

/// Non-linearity applied after the affine transform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    Relu,
    LeakyRelu,
    Tanh,
    Sigmoid,
    /// Only valid on the last layer of a network
    Softmax,
}

impl Activation {
    /// Apply in place. Softmax works on the whole vector, the rest per unit.
    pub fn apply(self, values: &mut [f32]) {
        match self {
            Activation::Identity => {}
            Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::LeakyRelu => values
                .iter_mut()
                .for_each(|v| *v = if *v > 0.0 { *v } else { *v * LEAKY_SLOPE }),
            Activation::Tanh => values.iter_mut().for_each(|v| *v = v.tanh()),
            Activation::Sigmoid => values.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
            Activation::Softmax => {
                let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for v in values.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                let sum = sum.max(f32::MIN_POSITIVE);
                values.iter_mut().for_each(|v| *v /= sum);
            }
        }
    }

    /// Derivative expressed in terms of the activation's output.
    ///
    /// Softmax returns 1: paired with an MSE gradient on the probabilities it
    /// behaves like the usual cross-entropy shortcut.
    pub fn derivative(self, output: f32) -> f32 {
        match self {
            Activation::Identity | Activation::Softmax => 1.0,
            Activation::Relu => {
                if output > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if output > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
            Activation::Tanh => 1.0 - output * output,
            Activation::Sigmoid => output * (1.0 - output),
        }
    }

    /// ReLU-family layers use He init, the rest Xavier
    pub fn prefers_he_init(self) -> bool {
        matches!(self, Activation::Relu | Activation::LeakyRelu)
    }
}
