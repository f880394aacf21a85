//! Replay buffers for experience storage and sampling.
//!
//! The buffer stores whole [`Transition`](crate::Transition)s in a ring
//! of fixed capacity. Eviction is FIFO: the slot that is overwritten is
//! always the oldest one, and a full buffer never transiently exceeds
//! its capacity (evict-before-insert). An optional prioritized mode adds
//! sum-tree sampling with importance-weight annealing.
mod base;
mod config;
mod iw_scheduler;
mod sum_tree;

pub use base::ReplayBuffer;
pub use config::{PerConfig, ReplayBufferConfig};
pub use iw_scheduler::IwScheduler;
pub use sum_tree::SumTree;
