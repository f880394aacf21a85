//! Exploration strategies of DQN.
use serde::{Deserialize, Serialize};
use tch::Tensor;

/// Explorers for DQN.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum DqnExplorer {
    /// Softmax action selection.
    Softmax(Softmax),

    /// Epsilon-greedy action selection.
    EpsilonGreedy(EpsilonGreedy),
}

/// Softmax explorer for DQN.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Softmax {}

#[allow(clippy::new_without_default)]
impl Softmax {
    /// Constructs softmax explorer.
    pub fn new() -> Self {
        Self {}
    }

    /// Takes an action based on the action values.
    pub fn action(&mut self, a: &Tensor) -> Tensor {
        a.softmax(-1, tch::Kind::Float).multinomial(1, true)
    }
}

/// Epsilon-greedy explorer for DQN, with epsilon annealed linearly from
/// `eps_start` to `eps_final` over `final_step` decisions.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct EpsilonGreedy {
    pub(super) n_opts: usize,
    pub(super) eps_start: f64,
    pub(super) eps_final: f64,
    pub(super) final_step: usize,
}

#[allow(clippy::new_without_default)]
impl EpsilonGreedy {
    /// Constructs epsilon-greedy explorer.
    pub fn new() -> Self {
        Self {
            n_opts: 0,
            eps_start: 1.0,
            eps_final: 0.02,
            final_step: 100_000,
        }
    }

    /// Takes an action based on the action values.
    pub fn action(&mut self, a: &Tensor) -> Tensor {
        let d = (self.eps_start - self.eps_final) / (self.final_step as f64);
        let eps = (self.eps_start - d * self.n_opts as f64).max(self.eps_final);
        let is_random = fastrand::f64() < eps;
        self.n_opts += 1;

        if is_random {
            let n_procs = a.size()[0] as u32;
            let n_actions = a.size()[1] as u32;
            Tensor::from_slice(
                (0..n_procs)
                    .map(|_| fastrand::u32(..n_actions) as i64)
                    .collect::<Vec<_>>()
                    .as_slice(),
            )
            .unsqueeze(-1)
        } else {
            a.argmax(-1, true)
        }
    }

    /// Set the epsilon value at the final step.
    pub fn eps_final(mut self, v: f64) -> Self {
        self.eps_final = v;
        self
    }

    /// Set the epsilon value at the start.
    pub fn eps_start(mut self, v: f64) -> Self {
        self.eps_start = v;
        self
    }

    /// Set the step at which epsilon reaches its final value.
    pub fn final_step(mut self, v: usize) -> Self {
        self.final_step = v;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;
    use tch::{Device, Kind};

    #[test]
    fn greedy_explorer_picks_the_argmax_when_annealed() {
        let mut explorer = EpsilonGreedy::new().eps_start(0.0).eps_final(0.0);
        let q = Tensor::from_slice(&[0.0f32, 5.0, 1.0]).unsqueeze(0);
        let a = explorer.action(&q);
        assert_eq!(i64::try_from(a).unwrap(), 1);
    }

    #[test]
    fn softmax_explorer_returns_a_valid_index() {
        let mut explorer = Softmax::new();
        let q = Tensor::randn(&[1, 4], (Kind::Float, Device::Cpu));
        let a = i64::try_from(explorer.action(&q)).unwrap();
        assert!((0..4).contains(&a));
    }
}
