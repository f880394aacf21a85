//! Configuration of the on-policy engine.
use crate::model::ModelConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Surrogate objective of the policy step.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum PolicyLoss {
    /// Plain advantage-weighted log likelihood.
    A2c,

    /// Clipped probability-ratio surrogate.
    PpoClip {
        /// Clipping range of the ratio, `[1 - eps, 1 + eps]`.
        eps: f64,
    },

    /// Off-policy correction with a truncated importance weight, for
    /// updates from slightly stale rollouts.
    ImportanceWeighted {
        /// Upper truncation of the importance weight.
        clip: f64,
    },
}

/// Constructs [`Ppo`](super::Ppo). `PC` and `VC` are the actor and
/// critic network configurations; the actor outputs action logits.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PpoConfig<PC, VC> {
    /// Actor network and optimizer.
    pub actor_config: ModelConfig<PC>,

    /// Value network and optimizer.
    pub critic_config: ModelConfig<VC>,

    /// Surrogate objective.
    pub policy_loss: PolicyLoss,

    /// Transitions required before an update may run.
    pub min_rollout: usize,

    /// Passes over the rollout per update.
    pub n_epochs: usize,

    /// Discount factor.
    pub discount_factor: f64,

    /// Entropy bonus coefficient.
    pub entropy_coef: f64,

    /// Normalize advantages to zero mean and unit variance.
    pub normalize_advantage: bool,

    /// Sample from the policy instead of taking the argmax.
    pub train: bool,

    /// Device name, `"cpu"` or `"cuda:<index>"`.
    pub device: String,

    /// Attribute name to on-disk stem remapping for save/load.
    #[serde(default)]
    pub network_map: BTreeMap<String, String>,
}

impl<PC, VC> PpoConfig<PC, VC> {
    /// Creates a configuration around actor and critic networks.
    pub fn new(actor_config: ModelConfig<PC>, critic_config: ModelConfig<VC>) -> Self {
        Self {
            actor_config,
            critic_config,
            policy_loss: PolicyLoss::PpoClip { eps: 0.2 },
            min_rollout: 1,
            n_epochs: 1,
            discount_factor: 0.99,
            entropy_coef: 0.0,
            normalize_advantage: true,
            train: true,
            device: "cpu".to_string(),
            network_map: BTreeMap::new(),
        }
    }

    /// Sets the surrogate objective.
    pub fn policy_loss(mut self, v: PolicyLoss) -> Self {
        self.policy_loss = v;
        self
    }

    /// Transitions required before an update may run.
    pub fn min_rollout(mut self, v: usize) -> Self {
        self.min_rollout = v;
        self
    }

    /// Sets the number of passes over the rollout.
    pub fn n_epochs(mut self, v: usize) -> Self {
        self.n_epochs = v;
        self
    }

    /// Sets the discount factor.
    pub fn discount_factor(mut self, v: f64) -> Self {
        self.discount_factor = v;
        self
    }

    /// Sets the entropy bonus coefficient.
    pub fn entropy_coef(mut self, v: f64) -> Self {
        self.entropy_coef = v;
        self
    }

    /// Enables or disables advantage normalization.
    pub fn normalize_advantage(mut self, v: bool) -> Self {
        self.normalize_advantage = v;
        self
    }

    /// Sets train/eval action selection.
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
