//! On-policy advantage actor-critic implemented with tch-rs.
use super::config::{PolicyLoss, PpoConfig};
use crate::{
    model::{ModelHandle, SubModel},
    util::{batch_part, from_tensor, parse_device, to_tensor, UpdateFlags, UpdateReport},
};
use anyhow::{anyhow, Result};
use std::{
    collections::BTreeMap,
    convert::TryFrom,
    path::Path,
    sync::{Arc, Mutex},
};
use tandem_core::{
    persist, Episode, ReplayBuffer, SampledBatch, TandemError, TensorData, Transition,
    ACTION_KEY, ACTION_LOG_PROB_KEY, STATE_KEY,
};
use tandem_dist::{SyncController, SyncModel};
use tch::{no_grad, Device, Kind, Tensor};

/// On-policy actor-critic update engine for discrete actions.
///
/// The replay buffer only ever holds the most recent rollouts; an
/// update drains it completely, runs the configured number of passes,
/// and leaves it empty. Stored transitions must carry the behavior
/// policy's log probability in `extra["action_log_prob"]`, which the
/// ratio-based surrogates need.
pub struct Ppo<P, V>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
    V: SubModel<Input = Tensor, Output = Tensor>,
{
    actor: ModelHandle<P>,
    critic: ModelHandle<V>,
    buffer: Arc<Mutex<ReplayBuffer>>,
    policy_loss: PolicyLoss,
    min_rollout: usize,
    n_epochs: usize,
    discount_factor: f64,
    entropy_coef: f64,
    normalize_advantage: bool,
    train: bool,
    device: Device,
    replay_device: Device,
    network_map: BTreeMap<String, String>,
    sync: Option<SyncController>,
    n_opts: usize,
}

impl<P, V> Ppo<P, V>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
    V: SubModel<Input = Tensor, Output = Tensor>,
{
    /// Constructs the engine over an on-policy buffer.
    pub fn build(
        config: PpoConfig<P::Config, V::Config>,
        buffer: Arc<Mutex<ReplayBuffer>>,
    ) -> Result<Self> {
        let device = parse_device(&config.device)?;
        let replay_device = parse_device(buffer.lock().unwrap().replay_device())?;
        let actor = ModelHandle::build(config.actor_config, device)?;
        let critic = ModelHandle::build(config.critic_config, device)?;

        Ok(Self {
            actor,
            critic,
            buffer,
            policy_loss: config.policy_loss,
            min_rollout: config.min_rollout,
            n_epochs: config.n_epochs,
            discount_factor: config.discount_factor,
            entropy_coef: config.entropy_coef,
            normalize_advantage: config.normalize_advantage,
            train: config.train,
            device,
            replay_device,
            network_map: config.network_map,
            sync: None,
            n_opts: 0,
        })
    }

    /// Attaches a synchronization controller for the actor slot.
    pub fn with_sync_controller(mut self, sync: SyncController) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Number of completed updates.
    pub fn n_opts(&self) -> usize {
        self.n_opts
    }

    /// Selects an action for `obs` (shape `[1, obs_dim]`), returning
    /// the action and its log probability under the current policy. The
    /// log probability belongs in the stored transition's
    /// `extra["action_log_prob"]`.
    pub fn act(&mut self, obs: &TensorData) -> Result<(TensorData, f32)> {
        if let Some(sync) = &mut self.sync {
            sync.sync_if_auto(&mut self.actor)?;
        }
        let x = to_tensor(obs, self.device);
        let (action, log_prob) = no_grad(|| -> Result<(Tensor, f32)> {
            let logits = self.actor.forward(&x);
            let log_probs = logits.log_softmax(-1, Kind::Float);
            let action = if self.train {
                log_probs.exp().multinomial(1, true)
            } else {
                log_probs.argmax(-1, true)
            };
            let log_prob = f32::try_from(log_probs.gather(-1, &action, false))?;
            Ok((action, log_prob))
        })?;
        Ok((from_tensor(&action.squeeze()), log_prob))
    }

    /// Stores a rollout transition.
    pub fn store(&self, transition: Transition) {
        self.buffer.lock().unwrap().store(transition);
    }

    /// Stores a whole episode atomically.
    pub fn store_episode(&self, episode: Episode) {
        self.buffer.lock().unwrap().store_episode(episode);
    }

    /// Runs one update over the whole stored rollout, then leaves the
    /// buffer empty.
    ///
    /// # Errors
    ///
    /// [`TandemError::InsufficientData`] when fewer than `min_rollout`
    /// transitions are stored; the rollout is kept for a later attempt.
    pub fn update(&mut self, flags: &UpdateFlags) -> Result<UpdateReport> {
        let transitions = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() < self.min_rollout {
                return Err(TandemError::InsufficientData {
                    requested: self.min_rollout,
                    available: buffer.len(),
                }
                .into());
            }
            buffer.take_all()
        };

        let returns = self.discounted_returns(&transitions)?;
        let batch = SampledBatch {
            transitions,
            indices: Vec::new(),
            weights: None,
        }
        .concatenate()?;

        let obs = batch_part(&batch.state, STATE_KEY, self.replay_device)?;
        let act = batch_part(&batch.action, ACTION_KEY, self.replay_device)?
            .to_kind(Kind::Int64)
            .unsqueeze(-1)
            .to(self.device);
        let returns = Tensor::from_slice(&returns).to(self.device);
        let old_log_probs = batch
            .extra
            .get(ACTION_LOG_PROB_KEY)
            .map(|v| Tensor::from_slice(&v[..]).to(self.device))
            .ok_or_else(|| anyhow!("stored rollout lacks {}", ACTION_LOG_PROB_KEY))?;

        let advantage = no_grad(|| {
            let value = self.critic.forward(&obs).squeeze_dim(-1);
            let adv = &returns - value;
            if self.normalize_advantage {
                let std = adv.std(true).clamp_min(1e-6);
                (&adv - adv.mean(Kind::Float)) / std
            } else {
                adv
            }
        });

        let mut report = UpdateReport::default();
        for _ in 0..self.n_epochs {
            if flags.update_policy {
                report.loss_actor = Some(self.update_actor(&obs, &act, &advantage, &old_log_probs)?);
            }
            if flags.update_value {
                let value = self.critic.forward(&obs).squeeze_dim(-1);
                let loss = value.mse_loss(&returns, tch::Reduction::Mean);
                self.critic.backward_step(&loss);
                report.loss_critic = Some(f32::try_from(loss)?);
            }
        }

        self.n_opts += 1;

        if let Some(sync) = &mut self.sync {
            sync.publish(&self.actor)?;
        }

        Ok(report)
    }

    fn update_actor(
        &mut self,
        obs: &Tensor,
        act: &Tensor,
        advantage: &Tensor,
        old_log_probs: &Tensor,
    ) -> Result<f32> {
        let logits = self.actor.forward(obs);
        let log_probs = logits.log_softmax(-1, Kind::Float);
        let new_log_probs = log_probs.gather(-1, act, false).squeeze_dim(-1);
        let entropy = -(log_probs.exp() * &log_probs)
            .sum_dim_intlist(Some([-1].as_slice()), false, Kind::Float)
            .mean(Kind::Float);

        let surrogate = match &self.policy_loss {
            PolicyLoss::A2c => -(&new_log_probs * advantage).mean(Kind::Float),
            PolicyLoss::PpoClip { eps } => {
                let ratio = (&new_log_probs - old_log_probs).exp();
                let unclipped = &ratio * advantage;
                let clipped = ratio.clamp(1.0 - eps, 1.0 + eps) * advantage;
                -unclipped.min_other(&clipped).mean(Kind::Float)
            }
            PolicyLoss::ImportanceWeighted { clip } => {
                let rho = (&new_log_probs - old_log_probs)
                    .exp()
                    .clamp_max(*clip)
                    .detach();
                -(rho * &new_log_probs * advantage).mean(Kind::Float)
            }
        };

        let loss = surrogate - self.entropy_coef * entropy;
        self.actor.backward_step(&loss);
        Ok(f32::try_from(loss)?)
    }

    /// Discounted returns per transition. Episodes reset at terminal
    /// flags; a trailing unfinished episode bootstraps from the value
    /// of its last next state.
    fn discounted_returns(&self, transitions: &[Transition]) -> Result<Vec<f32>> {
        let n = transitions.len();
        let mut returns = vec![0f32; n];
        let mut running = 0f32;
        for i in (0..n).rev() {
            let t = &transitions[i];
            if t.terminal {
                running = 0.0;
            } else if i == n - 1 {
                let next = t
                    .next_state
                    .get(STATE_KEY)
                    .ok_or_else(|| anyhow!("transition lacks {}", STATE_KEY))?;
                let x = to_tensor(next, self.device);
                running = no_grad(|| -> Result<f32> {
                    Ok(f32::try_from(self.critic.forward(&x).squeeze())?)
                })?;
            }
            running = t.reward + self.discount_factor as f32 * running;
            returns[i] = running;
        }
        Ok(returns)
    }

    /// Saves actor and critic, one file per net keyed by `version`.
    pub fn save<D: AsRef<Path>>(&self, dir: D, version: usize) -> Result<()> {
        let mut networks = BTreeMap::new();
        networks.insert("actor".to_string(), self.actor.snapshot());
        networks.insert("critic".to_string(), self.critic.snapshot());
        persist::save_group(dir, &networks, &self.network_map, version)
    }

    /// Loads the networks saved by [`save`](Self::save).
    pub fn load<D: AsRef<Path>>(&mut self, dir: D, version: usize) -> Result<()> {
        let networks = persist::load_group(dir, &["actor", "critic"], &self.network_map, version)?;
        self.actor.load_snapshot(&networks["actor"])?;
        self.critic.load_snapshot(&networks["critic"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ModelConfig, Mlp, MlpConfig};
    use tandem_core::{ReplayBufferConfig, TensorMap};

    const OBS_DIM: i64 = 3;
    const N_ACTIONS: i64 = 2;

    fn config() -> PpoConfig<MlpConfig, MlpConfig> {
        let actor = ModelConfig::new(MlpConfig::new(OBS_DIM, vec![16], N_ACTIONS));
        let critic = ModelConfig::new(MlpConfig::new(OBS_DIM, vec![16], 1));
        PpoConfig::new(actor, critic).min_rollout(8).n_epochs(2)
    }

    fn engine(config: PpoConfig<MlpConfig, MlpConfig>) -> Ppo<Mlp, Mlp> {
        let buffer = Arc::new(Mutex::new(ReplayBuffer::build(
            &ReplayBufferConfig::default().capacity(128),
        )));
        Ppo::build(config, buffer).unwrap()
    }

    fn rollout(ppo: &mut Ppo<Mlp, Mlp>, len: usize) {
        for i in 0..len {
            let mut state = TensorMap::new();
            state.insert(
                STATE_KEY.to_string(),
                TensorData::new(vec![1, OBS_DIM], vec![i as f32 * 0.1, 0.2, -0.3]).unwrap(),
            );
            let obs = state[STATE_KEY].clone();
            let (action, log_prob) = ppo.act(&obs).unwrap();
            let mut action_map = TensorMap::new();
            action_map.insert(ACTION_KEY.to_string(), action);
            let mut next_state = TensorMap::new();
            next_state.insert(
                STATE_KEY.to_string(),
                TensorData::new(vec![1, OBS_DIM], vec![i as f32 * 0.1 + 0.05, 0.2, -0.3])
                    .unwrap(),
            );
            let t = Transition::new(state, action_map, next_state, 1.0, (i + 1) % 5 == 0)
                .with_extra(ACTION_LOG_PROB_KEY, log_prob);
            ppo.store(t);
        }
    }

    #[test]
    fn act_returns_an_action_and_its_log_prob() {
        let mut ppo = engine(config());
        let obs = TensorData::new(vec![1, OBS_DIM], vec![0.1, 0.2, 0.3]).unwrap();
        let (action, log_prob) = ppo.act(&obs).unwrap();
        assert!(action.shape().is_empty());
        assert!(log_prob <= 0.0);
    }

    #[test]
    fn update_drains_the_rollout_buffer() {
        let mut ppo = engine(config());
        rollout(&mut ppo, 10);
        let report = ppo.update(&UpdateFlags::default()).unwrap();
        assert!(report.loss_actor.is_some());
        assert!(report.loss_critic.is_some());
        assert_eq!(ppo.buffer.lock().unwrap().len(), 0);
    }

    #[test]
    fn update_below_min_rollout_keeps_the_data() {
        let mut ppo = engine(config());
        rollout(&mut ppo, 4);
        let err = ppo.update(&UpdateFlags::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TandemError>(),
            Some(TandemError::InsufficientData { .. })
        ));
        assert_eq!(ppo.buffer.lock().unwrap().len(), 4);
    }

    #[test]
    fn every_surrogate_variant_updates() {
        for policy_loss in [
            PolicyLoss::A2c,
            PolicyLoss::PpoClip { eps: 0.2 },
            PolicyLoss::ImportanceWeighted { clip: 1.0 },
        ]
        .iter()
        {
            let mut ppo = engine(config().policy_loss(policy_loss.clone()));
            rollout(&mut ppo, 10);
            let report = ppo.update(&UpdateFlags::default()).unwrap();
            assert!(report.loss_actor.is_some());
        }
    }

    #[test]
    fn discounted_returns_reset_at_terminals() {
        let ppo = engine(config().discount_factor(0.5));
        let mut transitions = Vec::new();
        for i in 0..3 {
            let mut state = TensorMap::new();
            state.insert(
                STATE_KEY.to_string(),
                TensorData::new(vec![1, OBS_DIM], vec![0.0, 0.0, 0.0]).unwrap(),
            );
            let mut action = TensorMap::new();
            action.insert(ACTION_KEY.to_string(), TensorData::scalar(0.0));
            transitions.push(Transition::new(
                state.clone(),
                action,
                state,
                1.0,
                i == 2,
            ));
        }
        let returns = ppo.discounted_returns(&transitions).unwrap();
        // terminal episode of rewards [1, 1, 1] with gamma 0.5
        assert!((returns[2] - 1.0).abs() < 1e-6);
        assert!((returns[1] - 1.5).abs() < 1e-6);
        assert!((returns[0] - 1.75).abs() < 1e-6);
    }
}
