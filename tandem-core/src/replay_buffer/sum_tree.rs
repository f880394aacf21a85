//! Sum tree for prioritized sampling.
//!
//! Adapted from the classic binary-indexed layout used by DQN replay
//! implementations: leaves hold `(p + eps)^alpha`, inner nodes hold the
//! sum of their children.
use segment_tree::{ops::MinIgnoreNaN, SegmentPoint};

/// Sum tree over priority values.
#[derive(Debug)]
pub struct SumTree {
    eps: f32,
    alpha: f32,
    capacity: usize,
    n_samples: usize,
    tree: Vec<f32>,
    min_tree: SegmentPoint<f32, MinIgnoreNaN>,

    /// Running maximum of raw priorities; new samples enter with it so
    /// they are guaranteed to be visited at least once.
    max_priority: f32,
}

impl SumTree {
    /// Creates a tree for `capacity` slots.
    pub fn new(capacity: usize, alpha: f32) -> Self {
        Self {
            eps: 1e-8,
            alpha,
            capacity,
            n_samples: 0,
            tree: vec![0f32; 2 * capacity - 1],
            min_tree: SegmentPoint::build(vec![f32::MAX; capacity], MinIgnoreNaN),
            max_priority: 1.0,
        }
    }

    fn propagate(&mut self, ix: usize, change: f32) {
        let parent = (ix - 1) / 2;
        self.tree[parent] += change;
        if parent != 0 {
            self.propagate(parent, change);
        }
    }

    fn retrieve(&self, ix: usize, s: f32) -> usize {
        let left = 2 * ix + 1;
        let right = left + 1;

        if left >= self.tree.len() {
            return ix;
        }

        if s <= self.tree[left] || self.tree[right] == 0f32 {
            self.retrieve(left, s)
        } else {
            self.retrieve(right, s - self.tree[left])
        }
    }

    /// Sum of all stored priority masses.
    pub fn total(&self) -> f32 {
        self.tree[0]
    }

    /// Priority exponent the tree was built with.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Raw priority assigned to fresh samples.
    pub fn max_priority(&self) -> f32 {
        self.max_priority
    }

    /// Registers the slot `ix` as holding a fresh sample.
    pub fn add(&mut self, ix: usize) {
        let p = self.max_priority;
        self.update(ix, p);
        if self.n_samples < self.capacity {
            self.n_samples += 1;
        }
    }

    /// Updates the raw priority of slot `ix`.
    pub fn update(&mut self, ix: usize, p: f32) {
        debug_assert!(ix < self.capacity);

        self.max_priority = self.max_priority.max(p);
        let p = (p + self.eps).powf(self.alpha);
        self.min_tree.modify(ix, p);
        let ix = ix + self.capacity - 1;
        let change = p - self.tree[ix];
        self.tree[ix] = p;
        self.propagate(ix, change);
    }

    /// Slot whose cumulative mass covers `s`.
    pub fn get(&self, s: f32) -> usize {
        let ix = self.retrieve(0, s);
        debug_assert!(ix >= self.capacity - 1);
        ix + 1 - self.capacity
    }

    /// Samples `batch_size` slots proportionally to their mass and
    /// returns them with importance weights.
    ///
    /// The weight is `(N * P(i))^-beta`, normalized by the maximum
    /// weight over all stored samples so that every weight is `<= 1`.
    pub fn sample(&self, batch_size: usize, beta: f32) -> (Vec<usize>, Vec<f32>) {
        let p_sum = self.total();
        let indices = (0..batch_size)
            .map(|_| self.get(p_sum * fastrand::f32()))
            .collect::<Vec<_>>();

        let n = self.n_samples as f32 / p_sum;
        // the global maximum weight belongs to the minimum-mass slot
        let w_max_inv = (n * self.min_tree.query(0, self.n_samples)).powf(beta);
        let ws = indices
            .iter()
            .map(|&ix| self.tree[ix + self.capacity - 1])
            .map(|p| (n * p).powf(-beta) * w_max_inv)
            .collect::<Vec<_>>();

        (indices, ws)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.n_samples
    }

    /// Returns true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.n_samples == 0
    }
}
