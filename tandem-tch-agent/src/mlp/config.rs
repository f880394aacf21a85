use serde::{Deserialize, Serialize};

/// Activation applied to the output layer.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum OutActivation {
    /// Raw linear output (Q values, logits).
    None,

    /// ReLU.
    Relu,

    /// Tanh, for actions bounded to [-1, 1].
    Tanh,
}

/// Configuration of [`Mlp`](super::Mlp).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct MlpConfig {
    pub(super) in_dim: i64,
    pub(super) units: Vec<i64>,
    pub(super) out_dim: i64,
    pub(super) out_activation: OutActivation,
}

impl MlpConfig {
    /// Creates a configuration with a linear output layer.
    pub fn new(in_dim: i64, units: Vec<i64>, out_dim: i64) -> Self {
        Self {
            in_dim,
            units,
            out_dim,
            out_activation: OutActivation::None,
        }
    }

    /// Sets the output activation.
    pub fn out_activation(mut self, v: OutActivation) -> Self {
        self.out_activation = v;
        self
    }

    /// The output dimension.
    pub fn out_dim(&self) -> i64 {
        self.out_dim
    }
}
