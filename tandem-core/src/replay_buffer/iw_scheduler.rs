//! Scheduling the exponent of importance weights for prioritized replay.
use serde::{Deserialize, Serialize};

/// Anneals the importance-weight exponent `beta` from an initial value
/// to a final value over a fixed number of optimization steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IwScheduler {
    /// Initial value of `beta`.
    pub beta_0: f32,

    /// Final value of `beta`.
    pub beta_final: f32,

    /// Optimization steps at which `beta` reaches its final value.
    pub n_opts_final: usize,

    /// Optimization steps taken so far.
    pub n_opts: usize,
}

impl IwScheduler {
    /// Creates a scheduler.
    pub fn new(beta_0: f32, beta_final: f32, n_opts_final: usize) -> Self {
        Self {
            beta_0,
            beta_final,
            n_opts_final,
            n_opts: 0,
        }
    }

    /// Current exponent of importance sampling weights.
    pub fn beta(&self) -> f32 {
        if self.n_opts >= self.n_opts_final {
            self.beta_final
        } else {
            let d = self.beta_final - self.beta_0;
            self.beta_0 + d * (self.n_opts as f32 / self.n_opts_final as f32)
        }
    }

    /// Advances the schedule by one optimization step.
    pub fn add_n_opts(&mut self) {
        self.n_opts += 1;
    }
}
