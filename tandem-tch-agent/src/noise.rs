//! Action-space exploration noise for continuous policies.
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tandem_core::TandemError;
use tch::{kind::FLOAT_CPU, Tensor};

/// Exploration noise applied to continuous actions.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum NoiseMode {
    /// With probability `eps`, replace the action with a uniform one.
    EpsilonGreedy {
        /// Probability of a random action.
        eps: f64,
    },

    /// Additive zero-mean Gaussian noise.
    Gaussian {
        /// Standard deviation.
        std: f64,
    },

    /// Gaussian noise clipped to `[-clip, clip]` before adding.
    ClippedGaussian {
        /// Standard deviation.
        std: f64,

        /// Clipping bound.
        clip: f64,
    },

    /// Temporally correlated Ornstein-Uhlenbeck noise.
    OrnsteinUhlenbeck {
        /// Mean reversion rate.
        theta: f64,

        /// Diffusion coefficient.
        sigma: f64,

        /// Time step.
        dt: f64,
    },
}

impl FromStr for NoiseMode {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epsilon_greedy" => Ok(NoiseMode::EpsilonGreedy { eps: 0.1 }),
            "gaussian" => Ok(NoiseMode::Gaussian { std: 0.1 }),
            "clipped_gaussian" => Ok(NoiseMode::ClippedGaussian {
                std: 0.2,
                clip: 0.5,
            }),
            "ornstein_uhlenbeck" => Ok(NoiseMode::OrnsteinUhlenbeck {
                theta: 0.15,
                sigma: 0.2,
                dt: 0.01,
            }),
            _ => Err(TandemError::UnknownNoiseMode(s.to_string())),
        }
    }
}

/// Applies a [`NoiseMode`] to actions, keeping the internal state the
/// Ornstein-Uhlenbeck process needs between steps.
pub struct ActionNoise {
    mode: NoiseMode,
    ou_state: Option<Tensor>,
}

impl ActionNoise {
    /// Creates an applier for `mode`.
    pub fn new(mode: NoiseMode) -> Self {
        Self {
            mode,
            ou_state: None,
        }
    }

    /// The configured mode.
    pub fn mode(&self) -> &NoiseMode {
        &self.mode
    }

    /// Resets temporal state; call at episode boundaries.
    pub fn reset(&mut self) {
        self.ou_state = None;
    }

    /// Perturbs `action` in place of the policy's deterministic output.
    pub fn apply(&mut self, action: &Tensor) -> Tensor {
        match &self.mode {
            NoiseMode::EpsilonGreedy { eps } => {
                if fastrand::f64() < *eps {
                    Tensor::rand(&action.size(), FLOAT_CPU).to(action.device()) * 2.0 - 1.0
                } else {
                    action.shallow_clone()
                }
            }
            NoiseMode::Gaussian { std } => {
                action + *std * Tensor::randn(&action.size(), FLOAT_CPU).to(action.device())
            }
            NoiseMode::ClippedGaussian { std, clip } => {
                let noise = *std * Tensor::randn(&action.size(), FLOAT_CPU).to(action.device());
                action + noise.clamp(-*clip, *clip)
            }
            NoiseMode::OrnsteinUhlenbeck { theta, sigma, dt } => {
                let prev = match &self.ou_state {
                    Some(state) => state.shallow_clone(),
                    None => Tensor::zeros(&action.size(), FLOAT_CPU).to(action.device()),
                };
                let state = &prev - theta * dt * &prev
                    + *sigma
                        * dt.sqrt()
                        * Tensor::randn(&action.size(), FLOAT_CPU).to(action.device());
                let noisy = action + &state;
                self.ou_state = Some(state);
                noisy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn known_mode_names_parse() {
        assert!(matches!(
            "gaussian".parse::<NoiseMode>().unwrap(),
            NoiseMode::Gaussian { .. }
        ));
        assert!(matches!(
            "ornstein_uhlenbeck".parse::<NoiseMode>().unwrap(),
            NoiseMode::OrnsteinUhlenbeck { .. }
        ));
    }

    #[test]
    fn unknown_mode_name_fails_fast() {
        let err = "pink".parse::<NoiseMode>().unwrap_err();
        assert!(matches!(err, TandemError::UnknownNoiseMode(s) if s == "pink"));
    }

    #[test]
    fn gaussian_noise_perturbs_the_action() {
        let mut noise = ActionNoise::new(NoiseMode::Gaussian { std: 1.0 });
        let action = Tensor::zeros(&[1, 4], (tch::Kind::Float, Device::Cpu));
        let noisy = noise.apply(&action);
        assert_eq!(noisy.size(), vec![1, 4]);
        assert!(!noisy.equal(&action));
    }

    #[test]
    fn ou_state_carries_over_and_resets() {
        let mut noise = ActionNoise::new(NoiseMode::OrnsteinUhlenbeck {
            theta: 0.15,
            sigma: 0.2,
            dt: 0.01,
        });
        let action = Tensor::zeros(&[1, 2], (tch::Kind::Float, Device::Cpu));
        noise.apply(&action);
        assert!(noise.ou_state.is_some());
        noise.reset();
        assert!(noise.ou_state.is_none());
    }
}
