//! Configuration of the DQN engine.
use super::explorer::{DqnExplorer, Softmax};
use crate::{model::ModelConfig, util::CriticLoss};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constructs [`Dqn`](super::Dqn). `C` is the Q network configuration.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct DqnConfig<C> {
    /// Q network and optimizer.
    pub model_config: ModelConfig<C>,

    /// Target blends once per this many updates.
    pub soft_update_interval: usize,

    /// Transitions required before updates may run.
    pub min_transitions_warmup: usize,

    /// Sampled batch size.
    pub batch_size: usize,

    /// Discount factor.
    pub discount_factor: f64,

    /// Target blend rate.
    pub tau: f64,

    /// Explore during action selection.
    pub train: bool,

    /// Exploration strategy.
    pub explorer: DqnExplorer,

    /// Bootstrap from the online net's argmax instead of the target's.
    #[serde(default)]
    pub double_dqn: bool,

    /// TD loss.
    pub critic_loss: CriticLoss,

    /// Device name, `"cpu"` or `"cuda:<index>"`.
    pub device: String,

    /// Attribute name to on-disk stem remapping for save/load.
    #[serde(default)]
    pub network_map: BTreeMap<String, String>,
}

impl<C> DqnConfig<C> {
    /// Creates a configuration around a Q network.
    pub fn new(model_config: ModelConfig<C>) -> Self {
        Self {
            model_config,
            soft_update_interval: 1,
            min_transitions_warmup: 1,
            batch_size: 1,
            discount_factor: 0.99,
            tau: 0.005,
            train: true,
            explorer: DqnExplorer::Softmax(Softmax::new()),
            double_dqn: false,
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

    /// Sets the explorer.
    pub fn explorer(mut self, v: DqnExplorer) -> Self {
        self.explorer = v;
        self
    }

    /// Enables or disables double DQN.
    pub fn double_dqn(mut self, v: bool) -> Self {
        self.double_dqn = v;
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
