//! Ring-buffer replay storage.
use super::{IwScheduler, ReplayBufferConfig, SumTree};
use crate::{Episode, SampledBatch, TandemError, Transition};
use anyhow::Result;
use log::trace;
use rand::{rngs::StdRng, SeedableRng};

/// State of prioritized sampling.
struct PerState {
    sum_tree: SumTree,
    iw_scheduler: IwScheduler,
}

/// A bounded store of transitions with FIFO eviction.
///
/// Uniform sampling draws distinct transitions within one call;
/// prioritized sampling (when configured) draws with replacement from a
/// sum tree and returns importance weights. The buffer itself is not
/// synchronized: concurrent writers share it behind a lock at the
/// coordination layer (see `tandem-dist`), which also makes episode
/// insertion atomic.
pub struct ReplayBuffer {
    capacity: usize,

    /// Next slot to write; when full, this is also the oldest slot.
    i: usize,

    size: usize,
    items: Vec<Transition>,
    rng: StdRng,
    per_state: Option<PerState>,
    replay_device: String,
}

impl ReplayBuffer {
    /// Creates a buffer from its configuration.
    pub fn build(config: &ReplayBufferConfig) -> Self {
        assert!(config.capacity > 0, "replay capacity must be positive");
        let per_state = config.per_config.as_ref().map(|per| PerState {
            sum_tree: SumTree::new(config.capacity, per.alpha),
            iw_scheduler: IwScheduler::new(per.beta_0, per.beta_final, per.n_opts_final),
        });
        Self {
            capacity: config.capacity,
            i: 0,
            size: 0,
            items: Vec::with_capacity(config.capacity.min(4096)),
            rng: StdRng::seed_from_u64(config.seed),
            per_state,
            replay_device: config.replay_device.clone(),
        }
    }

    /// Number of stored transitions.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if the buffer holds no transitions.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Device on which the compute backend materializes samples.
    pub fn replay_device(&self) -> &str {
        &self.replay_device
    }

    /// Appends one transition, overwriting the oldest slot when full.
    pub fn store(&mut self, transition: Transition) {
        if self.items.len() < self.capacity {
            self.items.push(transition);
        } else {
            // evict-before-insert: the slot at `i` is the oldest entry
            self.items[self.i] = transition;
        }
        if let Some(per) = &mut self.per_state {
            per.sum_tree.add(self.i);
        }
        self.i = (self.i + 1) % self.capacity;
        if self.size < self.capacity {
            self.size += 1;
        }
    }

    /// Appends a whole episode in order.
    pub fn store_episode(&mut self, episode: Episode) {
        trace!("store episode of {} transitions", episode.len());
        for t in episode {
            self.store(t);
        }
    }

    /// Samples `batch_size` transitions.
    ///
    /// Uniform mode samples without replacement, so the returned
    /// transitions are distinct; prioritized mode samples from the sum
    /// tree with replacement and fills in importance weights.
    ///
    /// # Errors
    ///
    /// [`TandemError::InsufficientData`] if fewer than `batch_size`
    /// transitions are stored. Recoverable: retry after more stores.
    pub fn sample(&mut self, batch_size: usize) -> Result<SampledBatch> {
        // Uniform sampling is without replacement, so it cannot serve
        // more than `size`; prioritized sampling draws with replacement
        // and only needs a non-empty buffer.
        let available = self.size;
        let undersized = match &self.per_state {
            Some(_) => available == 0,
            None => batch_size > available,
        };
        if undersized || batch_size == 0 {
            return Err(TandemError::InsufficientData {
                requested: batch_size,
                available,
            }
            .into());
        }

        let (indices, weights) = match &self.per_state {
            Some(per) => {
                let beta = per.iw_scheduler.beta();
                let (ixs, ws) = per.sum_tree.sample(batch_size, beta);
                (ixs, Some(ws))
            }
            None => {
                let logical = rand::seq::index::sample(&mut self.rng, self.size, batch_size);
                let ixs = logical
                    .into_iter()
                    .map(|l| self.physical_index(l))
                    .collect();
                (ixs, None)
            }
        };

        let transitions = indices.iter().map(|&ix| self.items[ix].clone()).collect();
        Ok(SampledBatch {
            transitions,
            indices,
            weights,
        })
    }

    /// Updates priorities of previously sampled slots from TD errors and
    /// advances the importance-weight schedule. No-op without
    /// prioritization.
    pub fn update_priorities(&mut self, indices: &[usize], td_errs: &[f32]) {
        if let Some(per) = &mut self.per_state {
            debug_assert_eq!(indices.len(), td_errs.len());
            for (&ix, &td) in indices.iter().zip(td_errs.iter()) {
                per.sum_tree.update(ix, td.abs());
            }
            per.iw_scheduler.add_n_opts();
        }
    }

    /// Atomically empties the buffer.
    pub fn clear(&mut self) {
        self.items.clear();
        self.i = 0;
        self.size = 0;
        if let Some(per) = &mut self.per_state {
            per.sum_tree = SumTree::new(self.capacity, per.sum_tree.alpha());
        }
    }

    /// Removes and returns all transitions in insertion order, oldest
    /// first. Used by the on-policy engines that consume each rollout
    /// exactly once.
    pub fn take_all(&mut self) -> Vec<Transition> {
        let out = self.iter().cloned().collect();
        self.clear();
        out
    }

    /// Iterates transitions oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        let (capacity, i, size) = (self.capacity, self.i, self.size);
        (0..size).map(move |l| {
            let ix = if size < capacity { l } else { (i + l) % capacity };
            &self.items[ix]
        })
    }

    fn physical_index(&self, logical: usize) -> usize {
        if self.size < self.capacity {
            logical
        } else {
            (self.i + logical) % self.capacity
        }
    }
}
