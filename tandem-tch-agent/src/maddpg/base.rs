//! MADDPG update engine implemented with tch-rs.
use super::{action_key, config::MaddpgConfig, reward_key, state_key};
use crate::{
    model::{ModelHandle, SubModel, SubModel2},
    noise::ActionNoise,
    util::{
        batch_part, from_tensor, parse_device, scalars_to_tensor, terminals_to_tensor, to_tensor,
        track, CriticLoss, UpdateFlags, UpdateReport,
    },
};
use anyhow::{bail, Result};
use std::{
    collections::BTreeMap,
    convert::TryFrom,
    path::Path,
    sync::{Arc, Mutex},
};
use tandem_core::{
    persist, Episode, ReplayBuffer, TandemError, TensorData, Transition, TransitionBatch,
};
use tandem_dist::SyncModel;
use tch::{no_grad, Device, Tensor};

struct AgentSlot<P, C>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
    C: SubModel2<Input1 = Tensor, Input2 = Tensor, Output = Tensor>,
{
    actor: ModelHandle<P>,
    actor_tgt: ModelHandle<P>,
    critic: ModelHandle<C>,
    critic_tgt: ModelHandle<C>,
    noise: ActionNoise,
}

/// MADDPG update engine.
///
/// Centralized training, decentralized execution: each agent's critic
/// consumes the joint observations and actions of the agents visible to
/// it, while its actor only ever sees the agent's own observation.
/// Joint transitions are stored once in a shared buffer under the keys
/// `state_<i>` / `action_<i>` (and optionally `reward_<i>` in the extra
/// map).
pub struct Maddpg<P, C>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
    C: SubModel2<Input1 = Tensor, Input2 = Tensor, Output = Tensor>,
{
    agents: Vec<AgentSlot<P, C>>,
    visibility: Vec<Vec<usize>>,
    buffer: Arc<Mutex<ReplayBuffer>>,
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
    n_opts: usize,
}

impl<P, C> Maddpg<P, C>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
    C: SubModel2<Input1 = Tensor, Input2 = Tensor, Output = Tensor>,
{
    /// Constructs the engine over a shared joint replay buffer.
    pub fn build(
        config: MaddpgConfig<P::Config, C::Config>,
        buffer: Arc<Mutex<ReplayBuffer>>,
    ) -> Result<Self> {
        let n_agents = config.actor_configs.len();
        if n_agents == 0 || config.critic_configs.len() != n_agents {
            bail!(
                "need one actor and one critic per agent, got {} actors and {} critics",
                n_agents,
                config.critic_configs.len()
            );
        }
        let visibility = match config.visibility {
            Some(v) => v,
            None => (0..n_agents).map(|_| (0..n_agents).collect()).collect(),
        };
        if visibility.len() != n_agents {
            bail!(
                "visibility has {} rows for {} agents",
                visibility.len(),
                n_agents
            );
        }
        for (i, visible) in visibility.iter().enumerate() {
            if !visible.contains(&i) {
                bail!("agent {} cannot see itself", i);
            }
            if visible.iter().any(|&j| j >= n_agents) {
                bail!("agent {} sees an out-of-range agent", i);
            }
        }

        let device = parse_device(&config.device)?;
        let replay_device = parse_device(buffer.lock().unwrap().replay_device())?;
        let mut agents = Vec::with_capacity(n_agents);
        for (actor_config, critic_config) in config
            .actor_configs
            .into_iter()
            .zip(config.critic_configs.into_iter())
        {
            let actor = ModelHandle::build(actor_config, device)?;
            let actor_tgt = actor.try_clone()?;
            let critic = ModelHandle::build(critic_config, device)?;
            let critic_tgt = critic.try_clone()?;
            agents.push(AgentSlot {
                actor,
                actor_tgt,
                critic,
                critic_tgt,
                noise: ActionNoise::new(config.noise_mode.clone()),
            });
        }

        Ok(Self {
            agents,
            visibility,
            buffer,
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
            n_opts: 0,
        })
    }

    /// Number of agent slots.
    pub fn n_agents(&self) -> usize {
        self.agents.len()
    }

    /// Number of completed updates.
    pub fn n_opts(&self) -> usize {
        self.n_opts
    }

    /// Selects agent `agent`'s action from its own observation only.
    pub fn act(&mut self, agent: usize, obs: &TensorData) -> Result<TensorData> {
        let train = self.train;
        let device = self.device;
        let slot = self
            .agents
            .get_mut(agent)
            .ok_or_else(|| TandemError::UnknownModel(format!("agent {}", agent)))?;
        let x = to_tensor(obs, device);
        let a = no_grad(|| slot.actor.forward(&x));
        let a = if train { slot.noise.apply(&a) } else { a };
        Ok(from_tensor(&a))
    }

    /// Stores a joint transition in the shared buffer.
    pub fn store(&self, transition: Transition) {
        self.buffer.lock().unwrap().store(transition);
    }

    /// Stores a whole joint episode atomically.
    pub fn store_episode(&self, episode: Episode) {
        self.buffer.lock().unwrap().store_episode(episode);
    }

    /// Runs one update across all agents on a single sampled batch.
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

        let mut loss_critic = 0f32;
        let mut loss_actor = 0f32;
        for agent in 0..self.agents.len() {
            if flags.update_value {
                loss_critic += self.update_critic(agent, &batch)?;
            }
            if flags.update_policy {
                loss_actor += self.update_actor(agent, &batch)?;
            }
        }

        self.soft_update_counter += 1;
        if flags.update_target && self.soft_update_counter >= self.soft_update_interval {
            self.soft_update_counter = 0;
            for slot in self.agents.iter_mut() {
                track(&mut slot.actor_tgt, &slot.actor, self.tau);
                track(&mut slot.critic_tgt, &slot.critic, self.tau);
            }
        }

        self.n_opts += 1;

        let n = self.agents.len() as f32;
        Ok(UpdateReport {
            loss_critic: if flags.update_value {
                Some(loss_critic / n)
            } else {
                None
            },
            loss_actor: if flags.update_policy {
                Some(loss_actor / n)
            } else {
                None
            },
        })
    }

    /// Joint observation of `agent`'s visible set, features side by side.
    fn joint_states(&self, agent: usize, batch: &TransitionBatch, next: bool) -> Result<Tensor> {
        let map = if next { &batch.next_state } else { &batch.state };
        let parts = self.visibility[agent]
            .iter()
            .map(|&j| batch_part(map, &state_key(j), self.replay_device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, -1))
    }

    fn joint_actions(&self, agent: usize, batch: &TransitionBatch) -> Result<Tensor> {
        let parts = self.visibility[agent]
            .iter()
            .map(|&j| batch_part(&batch.action, &action_key(j), self.replay_device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, -1))
    }

    fn agent_rewards(&self, agent: usize, batch: &TransitionBatch) -> Tensor {
        match batch.extra.get(&reward_key(agent)) {
            Some(rewards) => scalars_to_tensor(rewards, self.device),
            None => scalars_to_tensor(&batch.reward, self.device),
        }
    }

    fn update_critic(&mut self, agent: usize, batch: &TransitionBatch) -> Result<f32> {
        let joint_obs = self.joint_states(agent, batch, false)?;
        let joint_act = self.joint_actions(agent, batch)?;
        let reward = self.agent_rewards(agent, batch);
        let is_done = terminals_to_tensor(&batch.terminal, self.device);

        let pred = self.agents[agent]
            .critic
            .forward(&joint_obs, &joint_act)
            .squeeze_dim(-1);

        let tgt = no_grad(|| -> Result<Tensor> {
            let next_joint_obs = self.joint_states(agent, batch, true)?;
            let next_acts = self.visibility[agent]
                .iter()
                .map(|&j| {
                    let next_obs_j = batch_part(&batch.next_state, &state_key(j), self.replay_device)?;
                    Ok(self.agents[j].actor_tgt.forward(&next_obs_j))
                })
                .collect::<Result<Vec<_>>>()?;
            let next_joint_act = Tensor::cat(&next_acts, -1);
            let q = self.agents[agent]
                .critic_tgt
                .forward(&next_joint_obs, &next_joint_act)
                .squeeze_dim(-1);
            Ok(reward + (1 - is_done) * self.discount_factor * q)
        })?;

        let loss = self.critic_loss.loss(&pred, &tgt);
        self.agents[agent].critic.backward_step(&loss);
        Ok(f32::try_from(loss)?)
    }

    /// Deterministic policy gradient with the agent's own action
    /// replaced by its current actor output; other agents' stored
    /// actions stay fixed.
    fn update_actor(&mut self, agent: usize, batch: &TransitionBatch) -> Result<f32> {
        let joint_obs = self.joint_states(agent, batch, false)?;
        let substituted = self.visibility[agent]
            .iter()
            .map(|&j| {
                if j == agent {
                    let obs_j = batch_part(&batch.state, &state_key(j), self.replay_device)?;
                    Ok(self.agents[agent].actor.forward(&obs_j))
                } else {
                    // Stored parts join the actor's output in one cat, so
                    // they must share its device.
                    Ok(batch_part(&batch.action, &action_key(j), self.replay_device)?
                        .to(self.device))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let joint_act = Tensor::cat(&substituted, -1);

        let loss = -self.agents[agent]
            .critic
            .forward(&joint_obs, &joint_act)
            .mean(tch::Kind::Float);
        self.agents[agent].actor.backward_step(&loss);
        Ok(f32::try_from(loss)?)
    }

    /// Saves every agent's networks, one file per net keyed by
    /// `version`, under attrs `actor_<i>`, `critic_<i>` and targets.
    pub fn save<D: AsRef<Path>>(&self, dir: D, version: usize) -> Result<()> {
        let mut networks = BTreeMap::new();
        for (i, slot) in self.agents.iter().enumerate() {
            networks.insert(format!("actor_{}", i), slot.actor.snapshot());
            networks.insert(format!("actor_tgt_{}", i), slot.actor_tgt.snapshot());
            networks.insert(format!("critic_{}", i), slot.critic.snapshot());
            networks.insert(format!("critic_tgt_{}", i), slot.critic_tgt.snapshot());
        }
        persist::save_group(dir, &networks, &self.network_map, version)
    }

    /// Loads the networks saved by [`save`](Self::save).
    pub fn load<D: AsRef<Path>>(&mut self, dir: D, version: usize) -> Result<()> {
        let attrs: Vec<String> = (0..self.agents.len())
            .flat_map(|i| {
                vec![
                    format!("actor_{}", i),
                    format!("actor_tgt_{}", i),
                    format!("critic_{}", i),
                    format!("critic_tgt_{}", i),
                ]
            })
            .collect();
        let attr_refs: Vec<&str> = attrs.iter().map(String::as_str).collect();
        let networks = persist::load_group(dir, &attr_refs, &self.network_map, version)?;
        for (i, slot) in self.agents.iter_mut().enumerate() {
            slot.actor
                .load_snapshot(&networks[&format!("actor_{}", i)])?;
            slot.actor_tgt
                .load_snapshot(&networks[&format!("actor_tgt_{}", i)])?;
            slot.critic
                .load_snapshot(&networks[&format!("critic_{}", i)])?;
            slot.critic_tgt
                .load_snapshot(&networks[&format!("critic_tgt_{}", i)])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ModelConfig, Mlp, MlpConfig, OutActivation};
    use tandem_core::{ReplayBufferConfig, TensorMap};

    const N_AGENTS: usize = 3;
    const OBS_DIM: i64 = 2;
    const ACT_DIM: i64 = 1;

    fn config(visibility: Option<Vec<Vec<usize>>>) -> MaddpgConfig<MlpConfig, MlpConfig> {
        let widths: Vec<usize> = match &visibility {
            Some(v) => v.iter().map(|row| row.len()).collect(),
            None => vec![N_AGENTS; N_AGENTS],
        };
        let actors = (0..N_AGENTS)
            .map(|_| {
                ModelConfig::new(
                    MlpConfig::new(OBS_DIM, vec![8], ACT_DIM).out_activation(OutActivation::Tanh),
                )
            })
            .collect();
        let critics = widths
            .iter()
            .map(|&w| {
                ModelConfig::new(MlpConfig::new(
                    w as i64 * (OBS_DIM + ACT_DIM),
                    vec![8],
                    1,
                ))
            })
            .collect();
        let config = MaddpgConfig::new(actors, critics)
            .batch_size(4)
            .min_transitions_warmup(4);
        match visibility {
            Some(v) => config.visibility(v),
            None => config,
        }
    }

    fn engine(visibility: Option<Vec<Vec<usize>>>) -> Maddpg<Mlp, Mlp> {
        let buffer = Arc::new(Mutex::new(ReplayBuffer::build(
            &ReplayBufferConfig::default().capacity(32),
        )));
        Maddpg::build(config(visibility), buffer).unwrap()
    }

    fn joint_transition(i: usize) -> Transition {
        let mut state = TensorMap::new();
        let mut action = TensorMap::new();
        let mut next_state = TensorMap::new();
        let mut extra = std::collections::BTreeMap::new();
        for a in 0..N_AGENTS {
            state.insert(
                state_key(a),
                TensorData::new(vec![1, OBS_DIM], vec![i as f32 * 0.1, a as f32]).unwrap(),
            );
            action.insert(
                action_key(a),
                TensorData::new(vec![1, ACT_DIM], vec![0.3]).unwrap(),
            );
            next_state.insert(
                state_key(a),
                TensorData::new(vec![1, OBS_DIM], vec![i as f32 * 0.1 + 0.05, a as f32]).unwrap(),
            );
            extra.insert(reward_key(a), a as f32);
        }
        let mut t = Transition::new(state, action, next_state, 0.0, i % 5 == 4);
        t.extra = extra;
        t
    }

    #[test]
    fn each_actor_sees_only_its_own_observation() {
        let mut maddpg = engine(None);
        let obs = TensorData::new(vec![1, OBS_DIM], vec![0.1, 0.2]).unwrap();
        for a in 0..N_AGENTS {
            let act = maddpg.act(a, &obs).unwrap();
            assert_eq!(act.shape(), &[1, ACT_DIM]);
        }
    }

    #[test]
    fn update_runs_with_full_visibility() {
        let mut maddpg = engine(None);
        for i in 0..8 {
            maddpg.store(joint_transition(i));
        }
        let report = maddpg.update(&UpdateFlags::default()).unwrap();
        assert!(report.loss_critic.is_some());
        assert!(report.loss_actor.is_some());
    }

    #[test]
    fn update_runs_with_restricted_visibility() {
        let visibility = vec![vec![0, 1], vec![1, 2], vec![0, 2]];
        let mut maddpg = engine(Some(visibility));
        for i in 0..8 {
            maddpg.store(joint_transition(i));
        }
        let report = maddpg.update(&UpdateFlags::default()).unwrap();
        assert!(report.loss_critic.is_some());
    }

    #[test]
    fn build_rejects_an_agent_blind_to_itself() {
        let visibility = vec![vec![1], vec![1, 2], vec![2]];
        let buffer = Arc::new(Mutex::new(ReplayBuffer::build(
            &ReplayBufferConfig::default().capacity(8),
        )));
        assert!(Maddpg::<Mlp, Mlp>::build(config(Some(visibility)), buffer).is_err());
    }

    #[test]
    fn unknown_agent_index_fails() {
        let mut maddpg = engine(None);
        let obs = TensorData::new(vec![1, OBS_DIM], vec![0.1, 0.2]).unwrap();
        assert!(maddpg.act(N_AGENTS, &obs).is_err());
    }
}
