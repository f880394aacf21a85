//! ARS update engine implemented with tch-rs.
use super::config::ArsConfig;
use crate::{
    model::{ModelHandle, SubModel},
    util::{from_tensor, parse_device, to_tensor, UpdateFlags, UpdateReport},
};
use anyhow::Result;
use log::trace;
use std::{collections::BTreeMap, path::Path};
use tandem_core::{persist, RunningStat, Snapshot, TandemError, TensorData};
use tandem_dist::{SyncController, SyncModel};
use tch::{kind::FLOAT_CPU, no_grad, Device, Tensor};

/// Augmented random search update engine.
///
/// Keeps a central policy and, per round, `n_deltas` paired parameter
/// perturbations. Rollout workers request the perturbed policy by actor
/// type, `"pos_<i>"` or `"neg_<i>"`, report episodic returns with
/// [`store_reward`], and the update takes a rank-weighted direct step
/// on the central parameters. No replay buffer and no gradients are
/// involved.
///
/// [`store_reward`]: Ars::store_reward
pub struct Ars<P>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
{
    policy: ModelHandle<P>,
    // rollout copy holding theta +/- noise_std * delta
    scratch: ModelHandle<P>,
    loaded: Option<(usize, bool)>,
    deltas: Vec<Snapshot>,
    rewards: Vec<(Option<f32>, Option<f32>)>,
    filter: Option<RunningStat>,
    normalize_obs: bool,
    train: bool,
    n_deltas: usize,
    top_k: usize,
    noise_std: f64,
    learning_rate: f64,
    device: Device,
    network_map: BTreeMap<String, String>,
    sync: Option<SyncController>,
    n_opts: usize,
}

impl<P> Ars<P>
where
    P: SubModel<Input = Tensor, Output = Tensor>,
{
    /// Constructs the engine and generates the first perturbation round.
    pub fn build(config: ArsConfig<P::Config>) -> Result<Self> {
        let device = parse_device(&config.device)?;
        let policy = ModelHandle::build(config.policy_config, device)?;
        let scratch = policy.try_clone()?;
        let n_deltas = config.n_deltas;
        let top_k = config.top_k.unwrap_or(n_deltas).min(n_deltas).max(1);

        let mut ars = Self {
            policy,
            scratch,
            loaded: None,
            deltas: Vec::new(),
            rewards: Vec::new(),
            filter: None,
            normalize_obs: config.normalize_obs,
            train: config.train,
            n_deltas,
            top_k,
            noise_std: config.noise_std,
            learning_rate: config.learning_rate,
            device,
            network_map: config.network_map,
            sync: None,
            n_opts: 0,
        };
        ars.generate_deltas();
        Ok(ars)
    }

    /// Attaches a synchronization controller for the policy slot.
    pub fn with_sync_controller(mut self, sync: SyncController) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Number of completed updates.
    pub fn n_opts(&self) -> usize {
        self.n_opts
    }

    /// Actor types of the current round, one rollout wanted per type.
    pub fn actor_types(&self) -> Vec<String> {
        (0..self.n_deltas)
            .map(|i| format!("pos_{}", i))
            .chain((0..self.n_deltas).map(|i| format!("neg_{}", i)))
            .collect()
    }

    /// The observation filter, for publishing to other workers.
    pub fn filter(&self) -> Option<&RunningStat> {
        self.filter.as_ref()
    }

    /// Merges another worker's observation filter into this one.
    pub fn merge_filter(&mut self, other: &RunningStat) {
        match &mut self.filter {
            Some(filter) => filter.update(other),
            None => self.filter = Some(other.clone()),
        }
    }

    /// Selects an action from the central policy.
    pub fn act(&mut self, obs: &TensorData) -> Result<TensorData> {
        if let Some(sync) = &mut self.sync {
            sync.sync_if_auto(&mut self.policy)?;
        }
        let obs = self.filtered(obs)?;
        let x = to_tensor(&obs, self.device);
        let a = no_grad(|| self.policy.forward(&x));
        Ok(from_tensor(&a))
    }

    /// Selects an action from the perturbed policy named by
    /// `actor_type`.
    ///
    /// # Errors
    ///
    /// [`TandemError::UnknownActorType`] when the tag is not one of
    /// this round's [`actor_types`](Self::actor_types).
    pub fn act_perturbed(&mut self, actor_type: &str, obs: &TensorData) -> Result<TensorData> {
        let key = self.parse_actor_type(actor_type)?;
        if self.loaded != Some(key) {
            let (i, positive) = key;
            let sign = if positive { 1.0 } else { -1.0 };
            let mut perturbed = self.policy.snapshot();
            perturbed.axpy(sign * self.noise_std as f32, &self.deltas[i])?;
            self.scratch.load_snapshot(&perturbed)?;
            self.loaded = Some(key);
            trace!("loaded perturbation {}", actor_type);
        }
        let obs = self.filtered(obs)?;
        let x = to_tensor(&obs, self.device);
        let a = no_grad(|| self.scratch.forward(&x));
        Ok(from_tensor(&a))
    }

    /// Accumulates a rollout's return under its actor type.
    pub fn store_reward(&mut self, reward: f32, actor_type: &str) -> Result<()> {
        let (i, positive) = self.parse_actor_type(actor_type)?;
        let slot = &mut self.rewards[i];
        let entry = if positive { &mut slot.0 } else { &mut slot.1 };
        *entry = Some(entry.unwrap_or(0.0) + reward);
        Ok(())
    }

    /// Takes the rank-weighted step over the complete perturbation
    /// pairs, then starts a fresh round.
    ///
    /// # Errors
    ///
    /// [`TandemError::InsufficientData`] when no pair has both returns
    /// reported yet.
    pub fn update(&mut self, flags: &UpdateFlags) -> Result<UpdateReport> {
        if !flags.update_policy {
            return Ok(UpdateReport::default());
        }

        let mut pairs: Vec<(usize, f32, f32)> = self
            .rewards
            .iter()
            .enumerate()
            .filter_map(|(i, (pos, neg))| match (pos, neg) {
                (Some(p), Some(n)) => Some((i, *p, *n)),
                _ => None,
            })
            .collect();
        if pairs.is_empty() {
            return Err(TandemError::InsufficientData {
                requested: self.n_deltas,
                available: 0,
            }
            .into());
        }

        // best pairs first, ranked by their better direction
        pairs.sort_by(|a, b| {
            let ka = a.1.max(a.2);
            let kb = b.1.max(b.2);
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });
        pairs.truncate(self.top_k);

        let used: Vec<f32> = pairs.iter().flat_map(|&(_, p, n)| vec![p, n]).collect();
        let sigma = std_dev(&used).max(1e-8);

        let mut theta = self.policy.snapshot();
        let mut grad = zeros_like(&theta);
        for &(i, pos, neg) in pairs.iter() {
            grad.axpy(pos - neg, &self.deltas[i])?;
        }
        let scale = self.learning_rate as f32 / (pairs.len() as f32 * sigma);
        theta.axpy(scale, &grad)?;
        self.policy.load_snapshot(&theta)?;

        self.generate_deltas();
        self.n_opts += 1;

        if let Some(sync) = &mut self.sync {
            sync.publish(&self.policy)?;
        }

        let mean_used = used.iter().sum::<f32>() / used.len() as f32;
        Ok(UpdateReport {
            loss_critic: None,
            loss_actor: Some(-mean_used),
        })
    }

    /// Saves the central policy, one file keyed by `version`.
    pub fn save<D: AsRef<Path>>(&self, dir: D, version: usize) -> Result<()> {
        let mut networks = BTreeMap::new();
        networks.insert("policy".to_string(), self.policy.snapshot());
        persist::save_group(dir, &networks, &self.network_map, version)
    }

    /// Loads the policy saved by [`save`](Self::save).
    pub fn load<D: AsRef<Path>>(&mut self, dir: D, version: usize) -> Result<()> {
        let networks = persist::load_group(dir, &["policy"], &self.network_map, version)?;
        self.policy.load_snapshot(&networks["policy"])?;
        self.loaded = None;
        Ok(())
    }

    fn generate_deltas(&mut self) {
        let theta = self.policy.snapshot();
        self.deltas = (0..self.n_deltas)
            .map(|_| {
                let mut delta = Snapshot::new();
                for (name, t) in theta.iter() {
                    let noise = Tensor::randn(t.shape(), FLOAT_CPU);
                    delta.insert(name, from_tensor(&noise));
                }
                delta
            })
            .collect();
        self.rewards = vec![(None, None); self.n_deltas];
        self.loaded = None;
    }

    fn parse_actor_type(&self, actor_type: &str) -> Result<(usize, bool)> {
        let (positive, index) = if let Some(i) = actor_type.strip_prefix("pos_") {
            (true, i)
        } else if let Some(i) = actor_type.strip_prefix("neg_") {
            (false, i)
        } else {
            return Err(TandemError::UnknownActorType(actor_type.to_string()).into());
        };
        let index: usize = index
            .parse()
            .map_err(|_| TandemError::UnknownActorType(actor_type.to_string()))?;
        if index >= self.n_deltas {
            return Err(TandemError::UnknownActorType(actor_type.to_string()).into());
        }
        Ok((index, positive))
    }

    // The filter only learns in train mode; evaluation runs normalize
    // against whatever statistics were merged in so far.
    fn filtered(&mut self, obs: &TensorData) -> Result<TensorData> {
        if !self.normalize_obs {
            return Ok(obs.clone());
        }
        if self.train {
            let filter = self
                .filter
                .get_or_insert_with(|| RunningStat::new(obs.shape()));
            filter.push(obs)?;
        }
        match &self.filter {
            Some(filter) if filter.count() > 0 => filter.normalize(obs, 1e-8),
            _ => Ok(obs.clone()),
        }
    }
}

fn zeros_like(snapshot: &Snapshot) -> Snapshot {
    let mut out = Snapshot::new();
    for (name, t) in snapshot.iter() {
        out.insert(name, TensorData::zeros(t.shape()));
    }
    out
}

fn std_dev(values: &[f32]) -> f32 {
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ModelConfig, Mlp, MlpConfig, OutActivation};

    const OBS_DIM: i64 = 3;
    const ACT_DIM: i64 = 2;

    fn engine(n_deltas: usize) -> Ars<Mlp> {
        let policy = ModelConfig::new(
            MlpConfig::new(OBS_DIM, vec![8], ACT_DIM).out_activation(OutActivation::Tanh),
        );
        Ars::build(ArsConfig::new(policy).n_deltas(n_deltas).top_k(2)).unwrap()
    }

    fn obs() -> TensorData {
        TensorData::new(vec![1, OBS_DIM], vec![0.1, -0.2, 0.3]).unwrap()
    }

    #[test]
    fn a_round_offers_paired_actor_types() {
        let ars = engine(3);
        let types = ars.actor_types();
        assert_eq!(types.len(), 6);
        assert!(types.contains(&"pos_0".to_string()));
        assert!(types.contains(&"neg_2".to_string()));
    }

    #[test]
    fn unknown_actor_types_fail_fast() {
        let mut ars = engine(2);
        for bad in ["pos_2", "neg_x", "mid_0", ""].iter() {
            let err = ars.act_perturbed(bad, &obs()).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<TandemError>(),
                Some(TandemError::UnknownActorType(_))
            ));
            assert!(ars.store_reward(1.0, bad).is_err());
        }
    }

    #[test]
    fn perturbed_directions_differ_from_the_central_policy() {
        let mut ars = engine(2);
        let central = ars.act(&obs()).unwrap();
        let pos = ars.act_perturbed("pos_0", &obs()).unwrap();
        let neg = ars.act_perturbed("neg_0", &obs()).unwrap();
        assert!(!central.allclose(&pos, 1e-6) || !central.allclose(&neg, 1e-6));
    }

    #[test]
    fn update_moves_the_central_parameters() {
        let mut ars = engine(4);
        let before = ars.policy.snapshot();
        for i in 0..4 {
            ars.store_reward((i + 1) as f32, &format!("pos_{}", i)).unwrap();
            ars.store_reward(-(i as f32), &format!("neg_{}", i)).unwrap();
        }
        let report = ars.update(&UpdateFlags::default()).unwrap();
        assert!(report.loss_actor.is_some());
        assert!(!ars.policy.snapshot().allclose(&before, 1e-8));
        assert_eq!(ars.n_opts(), 1);
    }

    #[test]
    fn update_without_complete_pairs_reports_insufficient_data() {
        let mut ars = engine(2);
        ars.store_reward(1.0, "pos_0").unwrap();
        let err = ars.update(&UpdateFlags::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TandemError>(),
            Some(TandemError::InsufficientData { .. })
        ));
    }

    #[test]
    fn rewards_accumulate_within_a_rollout() {
        let mut ars = engine(1);
        ars.store_reward(1.0, "pos_0").unwrap();
        ars.store_reward(2.5, "pos_0").unwrap();
        assert_eq!(ars.rewards[0].0, Some(3.5));
    }

    #[test]
    fn observation_filter_converges_on_the_stream() {
        let mut ars = engine(1);
        for _ in 0..10 {
            ars.act(&obs()).unwrap();
        }
        let filter = ars.filter().unwrap();
        assert_eq!(filter.count(), 10);
        assert!(filter.mean().allclose(&obs(), 1e-5));
    }

    #[test]
    fn evaluation_keeps_the_filter_frozen() {
        let policy = ModelConfig::new(
            MlpConfig::new(OBS_DIM, vec![8], ACT_DIM).out_activation(OutActivation::Tanh),
        );
        let mut ars = Ars::<Mlp>::build(ArsConfig::new(policy).n_deltas(1).train(false)).unwrap();
        ars.act(&obs()).unwrap();
        ars.act_perturbed("pos_0", &obs()).unwrap();
        assert!(ars.filter().is_none());

        // merged statistics still normalize evaluation observations,
        // they just never grow from them
        let mut stats = RunningStat::new(&[1, OBS_DIM]);
        stats.push(&obs()).unwrap();
        ars.merge_filter(&stats);
        ars.act(&obs()).unwrap();
        assert_eq!(ars.filter().unwrap().count(), 1);
    }
}
