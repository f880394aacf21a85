//! DDPG update engine implemented with tch-rs.
use super::config::DdpgConfig;
use crate::{
    model::{ModelHandle, SubModel, SubModel2},
    noise::ActionNoise,
    util::{
        batch_part, from_tensor, parse_device, scalars_to_tensor, terminals_to_tensor, to_tensor,
        track, CriticLoss, UpdateFlags, UpdateReport,
    },
};
use anyhow::Result;
use std::{
    collections::BTreeMap,
    convert::TryFrom,
    path::Path,
    sync::{Arc, Mutex},
};
use tandem_core::{
    persist, Episode, ReplayBuffer, TandemError, TensorData, Transition, TransitionBatch,
    ACTION_KEY, STATE_KEY,
};
use tandem_dist::{SyncController, SyncModel};
use tch::{no_grad, Device, Tensor};

/// DDPG update engine.
///
/// Deterministic actor with action-space noise, critic trained by TD,
/// both with target copies. The value and policy steps are gated
/// separately, so their schedules can be decoupled. When a
/// [`SyncController`] is attached, the actor network is the distributed
/// slot: rollout workers pull it, the trainer publishes it.
pub struct Ddpg<P, C>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
    C: SubModel2<Input1 = Tensor, Input2 = Tensor, Output = Tensor>,
{
    actor: ModelHandle<P>,
    actor_tgt: ModelHandle<P>,
    critic: ModelHandle<C>,
    critic_tgt: ModelHandle<C>,
    buffer: Arc<Mutex<ReplayBuffer>>,
    noise: ActionNoise,
    soft_update_interval: usize,
    soft_update_counter: usize,
    min_transitions_warmup: usize,
    batch_size: usize,
    discount_factor: f64,
    tau: f64,
    train: bool,
    critic_loss: CriticLoss,
    device: Device,
    replay_device: Device,
    network_map: BTreeMap<String, String>,
    sync: Option<SyncController>,
    n_opts: usize,
}

impl<P, C> Ddpg<P, C>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
    C: SubModel2<Input1 = Tensor, Input2 = Tensor, Output = Tensor>,
{
    /// Constructs the engine over a shared replay buffer.
    pub fn build(
        config: DdpgConfig<P::Config, C::Config>,
        buffer: Arc<Mutex<ReplayBuffer>>,
    ) -> Result<Self> {
        let device = parse_device(&config.device)?;
        let replay_device = parse_device(buffer.lock().unwrap().replay_device())?;
        let actor = ModelHandle::build(config.actor_config, device)?;
        let actor_tgt = actor.try_clone()?;
        let critic = ModelHandle::build(config.critic_config, device)?;
        let critic_tgt = critic.try_clone()?;

        Ok(Self {
            actor,
            actor_tgt,
            critic,
            critic_tgt,
            buffer,
            noise: ActionNoise::new(config.noise_mode),
            soft_update_interval: config.soft_update_interval,
            soft_update_counter: 0,
            min_transitions_warmup: config.min_transitions_warmup,
            batch_size: config.batch_size,
            discount_factor: config.discount_factor,
            tau: config.tau,
            train: config.train,
            critic_loss: config.critic_loss,
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

    /// Resets temporal noise state; call at episode boundaries.
    pub fn reset_noise(&mut self) {
        self.noise.reset();
    }

    /// Selects an action for `obs` (shape `[1, obs_dim]`), perturbed in
    /// train mode. Pulls fresh actor parameters first when auto-sync is
    /// on.
    pub fn act(&mut self, obs: &TensorData) -> Result<TensorData> {
        if let Some(sync) = &mut self.sync {
            sync.sync_if_auto(&mut self.actor)?;
        }
        let x = to_tensor(obs, self.device);
        let a = no_grad(|| self.actor.forward(&x));
        let a = if self.train { self.noise.apply(&a) } else { a };
        Ok(from_tensor(&a))
    }

    /// Stores a transition in the replay buffer.
    pub fn store(&self, transition: Transition) {
        self.buffer.lock().unwrap().store(transition);
    }

    /// Stores a whole episode atomically.
    pub fn store_episode(&self, episode: Episode) {
        self.buffer.lock().unwrap().store_episode(episode);
    }

    /// Runs one update: TD step on the critic, deterministic policy
    /// gradient on the actor, target blend, publish.
    ///
    /// # Errors
    ///
    /// [`TandemError::InsufficientData`] until the warmup threshold is
    /// reached.
    pub fn update(&mut self, flags: &UpdateFlags) -> Result<UpdateReport> {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() < self.min_transitions_warmup {
                return Err(TandemError::InsufficientData {
                    requested: self.min_transitions_warmup,
                    available: buffer.len(),
                }
                .into());
            }
            buffer.sample(self.batch_size)?
        };
        let batch = batch.concatenate()?;

        let mut report = UpdateReport::default();
        if flags.update_value {
            report.loss_critic = Some(self.update_critic(&batch)?);
        }
        if flags.update_policy {
            report.loss_actor = Some(self.update_actor(&batch)?);
        }

        self.soft_update_counter += 1;
        if flags.update_target && self.soft_update_counter >= self.soft_update_interval {
            self.soft_update_counter = 0;
            track(&mut self.actor_tgt, &self.actor, self.tau);
            track(&mut self.critic_tgt, &self.critic, self.tau);
        }

        self.n_opts += 1;

        if let Some(sync) = &mut self.sync {
            sync.publish(&self.actor)?;
        }

        Ok(report)
    }

    fn update_critic(&mut self, batch: &TransitionBatch) -> Result<f32> {
        let obs = batch_part(&batch.state, STATE_KEY, self.replay_device)?;
        let act = batch_part(&batch.action, ACTION_KEY, self.replay_device)?;
        let next_obs = batch_part(&batch.next_state, STATE_KEY, self.replay_device)?;
        let reward = scalars_to_tensor(&batch.reward, self.device);
        let is_done = terminals_to_tensor(&batch.terminal, self.device);

        let pred = self.critic.forward(&obs, &act).squeeze_dim(-1);
        let tgt = no_grad(|| {
            let next_act = self.actor_tgt.forward(&next_obs);
            let q = self.critic_tgt.forward(&next_obs, &next_act).squeeze_dim(-1);
            reward + (1 - is_done) * self.discount_factor * q
        });

        let loss = self.critic_loss.loss(&pred, &tgt);
        self.critic.backward_step(&loss);
        Ok(f32::try_from(loss)?)
    }

    fn update_actor(&mut self, batch: &TransitionBatch) -> Result<f32> {
        let obs = batch_part(&batch.state, STATE_KEY, self.replay_device)?;
        let act = self.actor.forward(&obs);
        let loss = -self.critic.forward(&obs, &act).mean(tch::Kind::Float);
        self.actor.backward_step(&loss);
        Ok(f32::try_from(loss)?)
    }

    /// Saves all four networks, one file per net keyed by `version`.
    pub fn save<D: AsRef<Path>>(&self, dir: D, version: usize) -> Result<()> {
        let mut networks = BTreeMap::new();
        networks.insert("actor".to_string(), self.actor.snapshot());
        networks.insert("actor_tgt".to_string(), self.actor_tgt.snapshot());
        networks.insert("critic".to_string(), self.critic.snapshot());
        networks.insert("critic_tgt".to_string(), self.critic_tgt.snapshot());
        persist::save_group(dir, &networks, &self.network_map, version)
    }

    /// Loads the networks saved by [`save`](Self::save).
    pub fn load<D: AsRef<Path>>(&mut self, dir: D, version: usize) -> Result<()> {
        let networks = persist::load_group(
            dir,
            &["actor", "actor_tgt", "critic", "critic_tgt"],
            &self.network_map,
            version,
        )?;
        for (attr, snapshot) in networks.iter() {
            match attr.as_str() {
                "actor" => self.actor.load_snapshot(snapshot)?,
                "actor_tgt" => self.actor_tgt.load_snapshot(snapshot)?,
                "critic" => self.critic.load_snapshot(snapshot)?,
                "critic_tgt" => self.critic_tgt.load_snapshot(snapshot)?,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::ModelConfig,
        noise::NoiseMode,
        Mlp, MlpConfig, OutActivation,
    };
    use tandem_core::{ReplayBufferConfig, TensorMap};

    const OBS_DIM: i64 = 3;
    const ACT_DIM: i64 = 2;

    fn config() -> DdpgConfig<MlpConfig, MlpConfig> {
        let actor = ModelConfig::new(
            MlpConfig::new(OBS_DIM, vec![16], ACT_DIM).out_activation(OutActivation::Tanh),
        );
        let critic = ModelConfig::new(MlpConfig::new(OBS_DIM + ACT_DIM, vec![16], 1));
        DdpgConfig::new(actor, critic)
            .batch_size(8)
            .min_transitions_warmup(8)
            .noise_mode(NoiseMode::OrnsteinUhlenbeck {
                theta: 0.15,
                sigma: 0.2,
                dt: 0.01,
            })
    }

    fn engine() -> Ddpg<Mlp, Mlp> {
        let buffer = Arc::new(Mutex::new(ReplayBuffer::build(
            &ReplayBufferConfig::default().capacity(64),
        )));
        Ddpg::build(config(), buffer).unwrap()
    }

    fn transition(i: usize) -> Transition {
        let mut state = TensorMap::new();
        state.insert(
            STATE_KEY.to_string(),
            TensorData::new(vec![1, OBS_DIM], vec![i as f32 * 0.1, 0.2, -0.1]).unwrap(),
        );
        let mut action = TensorMap::new();
        action.insert(
            ACTION_KEY.to_string(),
            TensorData::new(vec![1, ACT_DIM], vec![0.5, -0.5]).unwrap(),
        );
        let mut next_state = TensorMap::new();
        next_state.insert(
            STATE_KEY.to_string(),
            TensorData::new(vec![1, OBS_DIM], vec![i as f32 * 0.1 + 0.05, 0.1, 0.0]).unwrap(),
        );
        Transition::new(state, action, next_state, 1.0, i % 7 == 6)
    }

    #[test]
    fn act_produces_a_bounded_action_row() {
        let mut ddpg = engine();
        let obs = TensorData::new(vec![1, OBS_DIM], vec![0.1, 0.2, 0.3]).unwrap();
        let a = ddpg.act(&obs).unwrap();
        assert_eq!(a.shape(), &[1, ACT_DIM]);
    }

    #[test]
    fn update_reports_both_losses() {
        let mut ddpg = engine();
        for i in 0..16 {
            ddpg.store(transition(i));
        }
        let report = ddpg.update(&UpdateFlags::default()).unwrap();
        assert!(report.loss_critic.is_some());
        assert!(report.loss_actor.is_some());
    }

    #[test]
    fn policy_step_can_be_gated_off() {
        let mut ddpg = engine();
        for i in 0..16 {
            ddpg.store(transition(i));
        }
        let flags = UpdateFlags::default().update_policy(false);
        let report = ddpg.update(&flags).unwrap();
        assert!(report.loss_critic.is_some());
        assert!(report.loss_actor.is_none());
    }

    #[test]
    fn update_before_warmup_reports_insufficient_data() {
        let mut ddpg = engine();
        let err = ddpg.update(&UpdateFlags::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TandemError>(),
            Some(TandemError::InsufficientData { .. })
        ));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir::TempDir::new("ddpg").unwrap();
        let a = engine();
        a.save(dir.path(), 1).unwrap();
        let mut b = engine();
        b.load(dir.path(), 1).unwrap();
        assert!(a.actor.snapshot().allclose(&b.actor.snapshot(), 1e-6));
        assert!(a.critic.snapshot().allclose(&b.critic.snapshot(), 1e-6));
    }
}
