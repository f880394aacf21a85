//! DQN update engine implemented with tch-rs.
use super::{config::DqnConfig, explorer::DqnExplorer};
use crate::{
    model::{ModelHandle, SubModel},
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
use tch::{no_grad, Device, Kind, Tensor};

/// DQN update engine.
///
/// Owns the online and target Q networks and a shared replay buffer.
/// With a [`SyncController`] attached it becomes one end of the
/// Apex-style distributed setup: actors pull the Q network before
/// acting, the trainer publishes it after every update.
pub struct Dqn<Q>
where
    Q: SubModel<Input = Tensor, Output = Tensor>,
{
    qnet: ModelHandle<Q>,
    qnet_tgt: ModelHandle<Q>,
    buffer: Arc<Mutex<ReplayBuffer>>,
    explorer: DqnExplorer,
    soft_update_interval: usize,
    soft_update_counter: usize,
    min_transitions_warmup: usize,
    batch_size: usize,
    discount_factor: f64,
    tau: f64,
    train: bool,
    double_dqn: bool,
    critic_loss: CriticLoss,
    device: Device,
    replay_device: Device,
    network_map: BTreeMap<String, String>,
    sync: Option<SyncController>,
    n_opts: usize,
}

impl<Q> Dqn<Q>
where
    Q: SubModel<Input = Tensor, Output = Tensor>,
{
    /// Constructs the engine over a shared replay buffer.
    pub fn build(config: DqnConfig<Q::Config>, buffer: Arc<Mutex<ReplayBuffer>>) -> Result<Self> {
        let device = parse_device(&config.device)?;
        let replay_device = parse_device(buffer.lock().unwrap().replay_device())?;
        let qnet = ModelHandle::build(config.model_config, device)?;
        let qnet_tgt = qnet.try_clone()?;

        Ok(Self {
            qnet,
            qnet_tgt,
            buffer,
            explorer: config.explorer,
            soft_update_interval: config.soft_update_interval,
            soft_update_counter: 0,
            min_transitions_warmup: config.min_transitions_warmup,
            batch_size: config.batch_size,
            discount_factor: config.discount_factor,
            tau: config.tau,
            train: config.train,
            double_dqn: config.double_dqn,
            critic_loss: config.critic_loss,
            device,
            replay_device,
            network_map: config.network_map,
            sync: None,
            n_opts: 0,
        })
    }

    /// Attaches a synchronization controller for the Q network slot.
    pub fn with_sync_controller(mut self, sync: SyncController) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Number of completed updates.
    pub fn n_opts(&self) -> usize {
        self.n_opts
    }

    /// Selects an action for `obs` (shape `[1, obs_dim]`), exploring in
    /// train mode. Pulls fresh parameters first when auto-sync is on.
    pub fn act(&mut self, obs: &TensorData) -> Result<TensorData> {
        if let Some(sync) = &mut self.sync {
            sync.sync_if_auto(&mut self.qnet)?;
        }
        let x = to_tensor(obs, self.device);
        let q = no_grad(|| self.qnet.forward(&x));
        let a = if self.train {
            match &mut self.explorer {
                DqnExplorer::Softmax(softmax) => softmax.action(&q),
                DqnExplorer::EpsilonGreedy(egreedy) => egreedy.action(&q),
            }
        } else {
            q.argmax(-1, true)
        };
        Ok(from_tensor(&a.squeeze()))
    }

    /// Stores a transition in the replay buffer.
    pub fn store(&self, transition: Transition) {
        self.buffer.lock().unwrap().store(transition);
    }

    /// Stores a whole episode atomically.
    pub fn store_episode(&self, episode: Episode) {
        self.buffer.lock().unwrap().store_episode(episode);
    }

    /// Runs one update: sample, TD step, target blend, publish.
    ///
    /// # Errors
    ///
    /// [`TandemError::InsufficientData`] until the warmup threshold is
    /// reached; callers retry once more experience arrived.
    pub fn update(&mut self, flags: &UpdateFlags) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();

        if flags.update_value {
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
            report.loss_critic = Some(self.update_critic(&batch)?);
        }

        self.soft_update_counter += 1;
        if flags.update_target && self.soft_update_counter >= self.soft_update_interval {
            self.soft_update_counter = 0;
            track(&mut self.qnet_tgt, &self.qnet, self.tau);
        }

        self.n_opts += 1;

        if let Some(sync) = &mut self.sync {
            sync.publish(&self.qnet)?;
        }

        Ok(report)
    }

    fn update_critic(&mut self, batch: &TransitionBatch) -> Result<f32> {
        // Sampled payloads land on the buffer's replay device; the
        // submodels move their inputs, index tensors move here.
        let obs = batch_part(&batch.state, STATE_KEY, self.replay_device)?;
        let act = batch_part(&batch.action, ACTION_KEY, self.replay_device)?
            .to_kind(Kind::Int64)
            .unsqueeze(-1)
            .to(self.device);
        let next_obs = batch_part(&batch.next_state, STATE_KEY, self.replay_device)?;
        let reward = scalars_to_tensor(&batch.reward, self.device);
        let is_done = terminals_to_tensor(&batch.terminal, self.device);

        let pred = {
            let x = self.qnet.forward(&obs);
            x.gather(-1, &act, false).squeeze_dim(-1)
        };

        let tgt = no_grad(|| {
            let q = if self.double_dqn {
                let y = self.qnet.forward(&next_obs).argmax(-1, false).unsqueeze(-1);
                self.qnet_tgt
                    .forward(&next_obs)
                    .gather(-1, &y, false)
                    .squeeze_dim(-1)
            } else {
                let x = self.qnet_tgt.forward(&next_obs);
                let y = x.argmax(-1, false).unsqueeze(-1);
                x.gather(-1, &y, false).squeeze_dim(-1)
            };
            reward + (1 - is_done) * self.discount_factor * q
        });

        // Prioritized batches reweight elementwise and feed TD errors
        // back as fresh priorities.
        let loss = if let Some(ws) = &batch.weights {
            let n = ws.len() as i64;
            let td_errs = (&pred - &tgt).abs();
            let loss = Tensor::from_slice(&ws[..]).to(self.device) * &td_errs;
            let loss = loss.smooth_l1_loss(
                &Tensor::zeros(&[n], tch::kind::FLOAT_CPU).to(self.device),
                tch::Reduction::Mean,
                1.0,
            );
            self.qnet.backward_step(&loss);
            let td_errs = Vec::<f32>::try_from(&td_errs)?;
            self.buffer
                .lock()
                .unwrap()
                .update_priorities(&batch.indices, &td_errs);
            loss
        } else {
            let loss = self.critic_loss.loss(&pred, &tgt);
            self.qnet.backward_step(&loss);
            loss
        };

        Ok(f32::try_from(loss)?)
    }

    /// Saves both Q networks, one file per net keyed by `version`.
    pub fn save<P: AsRef<Path>>(&self, dir: P, version: usize) -> Result<()> {
        let mut networks = BTreeMap::new();
        networks.insert("qnet".to_string(), self.qnet.snapshot());
        networks.insert("qnet_tgt".to_string(), self.qnet_tgt.snapshot());
        persist::save_group(dir, &networks, &self.network_map, version)
    }

    /// Loads both Q networks saved by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(&mut self, dir: P, version: usize) -> Result<()> {
        let mut networks =
            persist::load_group(dir, &["qnet", "qnet_tgt"], &self.network_map, version)?;
        for (attr, snapshot) in networks.iter_mut() {
            match attr.as_str() {
                "qnet" => self.qnet.load_snapshot(snapshot)?,
                "qnet_tgt" => self.qnet_tgt.load_snapshot(snapshot)?,
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
        dqn::explorer::EpsilonGreedy,
        model::ModelConfig,
        Mlp, MlpConfig,
    };
    use tandem_core::{PerConfig, ReplayBufferConfig, TensorMap};
    use tandem_dist::ParamServer;
    use test_log::test;

    const OBS_DIM: i64 = 3;
    const N_ACTIONS: i64 = 2;

    fn obs_map(seed: f32) -> TensorMap {
        let mut map = TensorMap::new();
        map.insert(
            STATE_KEY.to_string(),
            TensorData::new(vec![1, OBS_DIM], vec![seed, seed + 0.5, -seed]).unwrap(),
        );
        map
    }

    fn transition(i: usize) -> Transition {
        let mut action = TensorMap::new();
        action.insert(
            ACTION_KEY.to_string(),
            TensorData::scalar((i % N_ACTIONS as usize) as f32),
        );
        Transition::new(
            obs_map(i as f32 * 0.1),
            action,
            obs_map(i as f32 * 0.1 + 0.05),
            (i % 3) as f32,
            i % 5 == 4,
        )
    }

    fn engine(config: DqnConfig<MlpConfig>, buffer_config: ReplayBufferConfig) -> Dqn<Mlp> {
        let buffer = Arc::new(Mutex::new(ReplayBuffer::build(&buffer_config)));
        Dqn::build(config, buffer).unwrap()
    }

    fn config() -> DqnConfig<MlpConfig> {
        DqnConfig::new(ModelConfig::new(MlpConfig::new(
            OBS_DIM,
            vec![16],
            N_ACTIONS,
        )))
        .batch_size(8)
        .min_transitions_warmup(8)
        .explorer(DqnExplorer::EpsilonGreedy(EpsilonGreedy::new()))
    }

    #[test]
    fn update_before_warmup_reports_insufficient_data() {
        let mut dqn = engine(config(), ReplayBufferConfig::default().capacity(32));
        dqn.store(transition(0));
        let err = dqn.update(&UpdateFlags::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TandemError>(),
            Some(TandemError::InsufficientData { .. })
        ));
    }

    #[test]
    fn update_returns_a_critic_loss() {
        let mut dqn = engine(config(), ReplayBufferConfig::default().capacity(32));
        for i in 0..16 {
            dqn.store(transition(i));
        }
        let report = dqn.update(&UpdateFlags::default()).unwrap();
        assert!(report.loss_critic.unwrap() >= 0.0);
        assert_eq!(dqn.n_opts(), 1);
    }

    #[test]
    fn prioritized_update_feeds_td_errors_back() {
        let buffer_config = ReplayBufferConfig::default()
            .capacity(32)
            .per_config(PerConfig::default());
        let mut dqn = engine(config().double_dqn(true), buffer_config);
        for i in 0..16 {
            dqn.store(transition(i));
        }
        for _ in 0..3 {
            let report = dqn.update(&UpdateFlags::default()).unwrap();
            assert!(report.loss_critic.is_some());
        }
    }

    #[test]
    fn build_rejects_an_unknown_replay_device() {
        let buffer_config = ReplayBufferConfig::default()
            .capacity(32)
            .replay_device("tpu");
        let buffer = Arc::new(Mutex::new(ReplayBuffer::build(&buffer_config)));
        assert!(Dqn::<Mlp>::build(config(), buffer).is_err());
    }

    #[test]
    fn update_samples_from_the_configured_replay_device() {
        let buffer_config = ReplayBufferConfig::default()
            .capacity(32)
            .replay_device("cpu");
        let mut dqn = engine(config(), buffer_config);
        for i in 0..16 {
            dqn.store(transition(i));
        }
        let report = dqn.update(&UpdateFlags::default()).unwrap();
        assert!(report.loss_critic.unwrap() >= 0.0);
    }

    #[test]
    fn act_returns_a_valid_action_index() {
        let mut dqn = engine(config(), ReplayBufferConfig::default().capacity(32));
        let obs = TensorData::new(vec![1, OBS_DIM], vec![0.1, 0.2, 0.3]).unwrap();
        let a = dqn.act(&obs).unwrap();
        assert!(a.shape().is_empty());
        assert!((0.0..N_ACTIONS as f32).contains(&a.data()[0]));
    }

    #[test]
    fn trainer_publishes_and_actor_pulls() {
        let server = ParamServer::spawn();
        let mut trainer = engine(config(), ReplayBufferConfig::default().capacity(32))
            .with_sync_controller(SyncController::new(server.clone(), "qnet"));
        for i in 0..16 {
            trainer.store(transition(i));
        }
        trainer.update(&UpdateFlags::default()).unwrap();

        let mut actor = engine(config(), ReplayBufferConfig::default().capacity(32))
            .with_sync_controller(SyncController::new(server, "qnet"));
        let obs = TensorData::new(vec![1, OBS_DIM], vec![0.1, 0.2, 0.3]).unwrap();
        actor.act(&obs).unwrap();
        assert!(actor.qnet.snapshot().allclose(&trainer.qnet.snapshot(), 1e-6));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir::TempDir::new("dqn").unwrap();
        let mut a = engine(config(), ReplayBufferConfig::default().capacity(32));
        a.save(dir.path(), 7).unwrap();

        let mut b = engine(config(), ReplayBufferConfig::default().capacity(32));
        b.load(dir.path(), 7).unwrap();
        assert!(a.qnet.snapshot().allclose(&b.qnet.snapshot(), 1e-6));
        assert!(a.qnet_tgt.snapshot().allclose(&b.qnet_tgt.snapshot(), 1e-6));
    }
}
