//! Configuration of the ARS engine.
use crate::model::ModelConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constructs [`Ars`](super::Ars). `PC` is the policy network
/// configuration.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ArsConfig<PC> {
    /// Policy network. The optimizer slot is unused; ARS takes direct
    /// parameter steps.
    pub policy_config: ModelConfig<PC>,

    /// Number of perturbation pairs per update round.
    pub n_deltas: usize,

    /// Use only the best `top_k` pairs for the step. `None` uses all.
    pub top_k: Option<usize>,

    /// Scale of the parameter perturbations.
    pub noise_std: f64,

    /// Step size of the rank-weighted update.
    pub learning_rate: f64,

    /// Normalize observations with a running mean/variance filter.
    pub normalize_obs: bool,

    /// Update the filter statistics while acting. Evaluation runs keep
    /// the filter frozen.
    pub train: bool,

    /// Device name, `"cpu"` or `"cuda:<index>"`.
    pub device: String,

    /// Attribute name to on-disk stem remapping for save/load.
    #[serde(default)]
    pub network_map: BTreeMap<String, String>,
}

impl<PC> ArsConfig<PC> {
    /// Creates a configuration around a policy network.
    pub fn new(policy_config: ModelConfig<PC>) -> Self {
        Self {
            policy_config,
            n_deltas: 16,
            top_k: None,
            noise_std: 0.05,
            learning_rate: 0.02,
            normalize_obs: true,
            train: true,
            device: "cpu".to_string(),
            network_map: BTreeMap::new(),
        }
    }

    /// Sets the number of perturbation pairs.
    pub fn n_deltas(mut self, v: usize) -> Self {
        self.n_deltas = v;
        self
    }

    /// Restricts the step to the best pairs.
    pub fn top_k(mut self, v: usize) -> Self {
        self.top_k = Some(v);
        self
    }

    /// Sets the perturbation scale.
    pub fn noise_std(mut self, v: f64) -> Self {
        self.noise_std = v;
        self
    }

    /// Sets the step size.
    pub fn learning_rate(mut self, v: f64) -> Self {
        self.learning_rate = v;
        self
    }

    /// Enables or disables observation normalization.
    pub fn normalize_obs(mut self, v: bool) -> Self {
        self.normalize_obs = v;
        self
    }

    /// Sets train/eval filter behavior.
    pub fn train(mut self, v: bool) -> Self {
        self.train = v;
        self
    }

    /// Sets the device.
    pub fn device(mut self, v: impl Into<String>) -> Self {
        self.device = v.into();
        self
    }

    /// Sets the network map used by save and load.
    pub fn network_map(mut self, v: BTreeMap<String, String>) -> Self {
        self.network_map = v;
        self
    }
}
