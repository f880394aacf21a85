//! Transitions, episodes and sampled batches.
use crate::{TandemError, TensorData};
use anyhow::Result;
use std::collections::BTreeMap;

/// Named tensors, e.g. `{"state": ...}` for a single observation.
pub type TensorMap = BTreeMap<String, TensorData>;

/// One environment step, immutable once stored.
///
/// States and actions are maps from names to tensors so that multi-agent
/// and multi-modal setups can share the same storage; single-agent code
/// uses [`STATE_KEY`](crate::STATE_KEY) and
/// [`ACTION_KEY`](crate::ACTION_KEY).
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// Observation before the step.
    pub state: TensorMap,

    /// Action taken.
    pub action: TensorMap,

    /// Observation after the step.
    pub next_state: TensorMap,

    /// Scalar reward signal.
    pub reward: f32,

    /// Whether the episode ended at this step.
    pub terminal: bool,

    /// Algorithm extras, e.g. `action_log_prob` for on-policy methods.
    pub extra: BTreeMap<String, f32>,
}

impl Transition {
    /// Creates a transition without extras.
    pub fn new(
        state: TensorMap,
        action: TensorMap,
        next_state: TensorMap,
        reward: f32,
        terminal: bool,
    ) -> Self {
        Self {
            state,
            action,
            next_state,
            reward,
            terminal,
            extra: BTreeMap::new(),
        }
    }

    /// Adds an extra scalar, builder style.
    pub fn with_extra(mut self, key: &str, value: f32) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// An ordered sequence of transitions from one trajectory. Episodes are
/// the atomic unit of insertion into a replay buffer.
pub type Episode = Vec<Transition>;

/// Transitions concatenated along the batch dimension.
#[derive(Debug)]
pub struct TransitionBatch {
    /// Concatenated observations.
    pub state: TensorMap,

    /// Concatenated actions.
    pub action: TensorMap,

    /// Concatenated next observations.
    pub next_state: TensorMap,

    /// Rewards, one per transition.
    pub reward: Vec<f32>,

    /// Terminal flags, one per transition.
    pub terminal: Vec<bool>,

    /// Extras, keyed as in the transitions; missing entries are 0.
    pub extra: BTreeMap<String, Vec<f32>>,

    /// Buffer slot of each sampled transition, for priority feedback.
    pub indices: Vec<usize>,

    /// Importance sampling weights, present for prioritized sampling.
    pub weights: Option<Vec<f32>>,
}

impl TransitionBatch {
    /// Number of transitions in the batch.
    pub fn len(&self) -> usize {
        self.reward.len()
    }

    /// Returns true if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.reward.is_empty()
    }
}

/// A batch of sampled transitions before concatenation.
///
/// Callers that want raw transitions use [`SampledBatch::transitions`];
/// callers that want batch tensors call [`SampledBatch::concatenate`].
#[derive(Debug)]
pub struct SampledBatch {
    /// The sampled transitions, cloned out of the buffer.
    pub transitions: Vec<Transition>,

    /// Buffer slot of each transition.
    pub indices: Vec<usize>,

    /// Importance sampling weights, present for prioritized sampling.
    pub weights: Option<Vec<f32>>,
}

impl SampledBatch {
    /// Number of transitions.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Returns true if no transitions were sampled.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Concatenates the sampled transitions along the batch dimension.
    ///
    /// All transitions must carry the same state/action keys.
    pub fn concatenate(&self) -> Result<TransitionBatch> {
        let first = self.transitions.first().ok_or_else(|| {
            TandemError::InsufficientData {
                requested: 1,
                available: 0,
            }
        })?;

        let state = cat_maps(&self.transitions, first, Part::State)?;
        let action = cat_maps(&self.transitions, first, Part::Action)?;
        let next_state = cat_maps(&self.transitions, first, Part::NextState)?;

        let mut extra: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        for key in first.extra.keys() {
            let vals = self
                .transitions
                .iter()
                .map(|t| t.extra.get(key).copied().unwrap_or(0.0))
                .collect();
            extra.insert(key.clone(), vals);
        }

        Ok(TransitionBatch {
            state,
            action,
            next_state,
            reward: self.transitions.iter().map(|t| t.reward).collect(),
            terminal: self.transitions.iter().map(|t| t.terminal).collect(),
            extra,
            indices: self.indices.clone(),
            weights: self.weights.clone(),
        })
    }
}

enum Part {
    State,
    Action,
    NextState,
}

fn part_of<'a>(t: &'a Transition, part: &Part) -> &'a TensorMap {
    match part {
        Part::State => &t.state,
        Part::Action => &t.action,
        Part::NextState => &t.next_state,
    }
}

fn cat_maps(transitions: &[Transition], first: &Transition, part: Part) -> Result<TensorMap> {
    let mut out = TensorMap::new();
    for key in part_of(first, &part).keys() {
        let mut items = Vec::with_capacity(transitions.len());
        for t in transitions {
            let td = part_of(t, &part).get(key).ok_or_else(|| {
                TandemError::SnapshotMismatch(format!("transition lacks tensor {:?}", key))
            })?;
            items.push(td);
        }
        out.insert(key.clone(), TensorData::cat(&items)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ACTION_KEY, STATE_KEY};

    fn transition(reward: f32) -> Transition {
        let mut state = TensorMap::new();
        state.insert(
            STATE_KEY.to_string(),
            TensorData::new(vec![1, 2], vec![reward, reward]).unwrap(),
        );
        let mut action = TensorMap::new();
        action.insert(
            ACTION_KEY.to_string(),
            TensorData::new(vec![1, 1], vec![0.0]).unwrap(),
        );
        Transition::new(state.clone(), action, state, reward, false)
    }

    #[test]
    fn concatenate_stacks_states_and_rewards() {
        let batch = SampledBatch {
            transitions: vec![transition(1.0), transition(2.0), transition(3.0)],
            indices: vec![0, 1, 2],
            weights: None,
        };
        let batch = batch.concatenate().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.state[STATE_KEY].shape(), &[3, 2]);
        assert_eq!(batch.reward, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn concatenate_collects_extras() {
        let batch = SampledBatch {
            transitions: vec![
                transition(0.0).with_extra(crate::ACTION_LOG_PROB_KEY, -0.5),
                transition(0.0).with_extra(crate::ACTION_LOG_PROB_KEY, -1.5),
            ],
            indices: vec![0, 1],
            weights: None,
        };
        let batch = batch.concatenate().unwrap();
        assert_eq!(batch.extra[crate::ACTION_LOG_PROB_KEY], vec![-0.5, -1.5]);
    }

    #[test]
    fn concatenate_empty_fails() {
        let batch = SampledBatch {
            transitions: vec![],
            indices: vec![],
            weights: None,
        };
        assert!(batch.concatenate().is_err());
    }
}
