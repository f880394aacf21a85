//! Configuration of the DDPG engine.
use crate::{model::ModelConfig, noise::NoiseMode, util::CriticLoss};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constructs [`Ddpg`](super::Ddpg). `PC` and `CC` are the actor and
/// critic network configurations.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct DdpgConfig<PC, CC> {
    /// Actor network and optimizer.
    pub actor_config: ModelConfig<PC>,

    /// Critic network and optimizer.
    pub critic_config: ModelConfig<CC>,

    /// Targets blend once per this many updates.
    pub soft_update_interval: usize,

    /// Transitions required before updates may run.
    pub min_transitions_warmup: usize,

    /// Sampled batch size.
    pub batch_size: usize,

    /// Discount factor.
    pub discount_factor: f64,

    /// Target blend rate.
    pub tau: f64,

    /// Apply action noise during action selection.
    pub train: bool,

    /// Action-space exploration noise.
    pub noise_mode: NoiseMode,

    /// TD loss.
    pub critic_loss: CriticLoss,

    /// Device name, `"cpu"` or `"cuda:<index>"`.
    pub device: String,

    /// Attribute name to on-disk stem remapping for save/load.
    #[serde(default)]
    pub network_map: BTreeMap<String, String>,
}

impl<PC, CC> DdpgConfig<PC, CC> {
    /// Creates a configuration around actor and critic networks.
    pub fn new(actor_config: ModelConfig<PC>, critic_config: ModelConfig<CC>) -> Self {
        Self {
            actor_config,
            critic_config,
            soft_update_interval: 1,
            min_transitions_warmup: 1,
            batch_size: 1,
            discount_factor: 0.99,
            tau: 0.005,
            train: true,
            noise_mode: NoiseMode::Gaussian { std: 0.1 },
            critic_loss: CriticLoss::SmoothL1,
            device: "cpu".to_string(),
            network_map: BTreeMap::new(),
        }
    }

    /// Sets the soft update interval.
    pub fn soft_update_interval(mut self, v: usize) -> Self {
        self.soft_update_interval = v;
        self
    }

    /// Interval before starting optimization.
    pub fn min_transitions_warmup(mut self, v: usize) -> Self {
        self.min_transitions_warmup = v;
        self
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    /// Sets the discount factor.
    pub fn discount_factor(mut self, v: f64) -> Self {
        self.discount_factor = v;
        self
    }

    /// Sets the target blend rate.
    pub fn tau(mut self, v: f64) -> Self {
        self.tau = v;
        self
    }

    /// Sets train/eval action selection.
    pub fn train(mut self, v: bool) -> Self {
        self.train = v;
        self
    }

    /// Sets the exploration noise mode.
    pub fn noise_mode(mut self, v: NoiseMode) -> Self {
        self.noise_mode = v;
        self
    }

    /// Sets the TD loss.
    pub fn critic_loss(mut self, v: CriticLoss) -> Self {
        self.critic_loss = v;
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
