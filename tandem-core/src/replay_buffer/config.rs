//! Configuration of replay buffers.
use serde::{Deserialize, Serialize};

/// Configuration of prioritized sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerConfig {
    /// Exponent applied to priorities (`alpha`).
    pub alpha: f32,

    /// Initial exponent of importance sampling weights (`beta`).
    pub beta_0: f32,

    /// Final value of `beta`.
    pub beta_final: f32,

    /// Optimization steps at which `beta` reaches its final value.
    pub n_opts_final: usize,
}

impl Default for PerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta_0: 0.4,
            beta_final: 1.0,
            n_opts_final: 500_000,
        }
    }
}

/// Configuration of [`ReplayBuffer`](super::ReplayBuffer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayBufferConfig {
    /// Maximum number of transitions held at any observable point.
    pub capacity: usize,

    /// Seed of the sampling RNG.
    pub seed: u64,

    /// Device on which samples are materialized by the compute backend.
    ///
    /// Storage itself is always host memory; transfers happen at sample
    /// time so the storage path never blocks on a device.
    pub replay_device: String,

    /// Enables prioritized sampling when present.
    pub per_config: Option<PerConfig>,
}

impl Default for ReplayBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            seed: 42,
            replay_device: "cpu".to_string(),
            per_config: None,
        }
    }
}

impl ReplayBufferConfig {
    /// Sets the capacity.
    pub fn capacity(mut self, v: usize) -> Self {
        self.capacity = v;
        self
    }

    /// Sets the sampling seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Sets the device samples are materialized on.
    pub fn replay_device(mut self, v: &str) -> Self {
        self.replay_device = v.to_string();
        self
    }

    /// Enables prioritized sampling.
    pub fn per_config(mut self, v: PerConfig) -> Self {
        self.per_config = Some(v);
        self
    }
}
