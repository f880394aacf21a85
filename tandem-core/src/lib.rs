#![warn(missing_docs)]
//! Backend-free data model for distributed reinforcement learning.
//!
//! This crate holds everything that does not need a neural-network
//! backend: transitions and episodes, replay buffers (uniform and
//! prioritized), model snapshots with soft-update blending, running
//! statistics for observation normalization, and snapshot persistence.
//! Coordination primitives live in `tandem-dist`; gradient-based update
//! engines live in `tandem-tch-agent`.
pub mod error;
pub mod persist;
pub mod replay_buffer;

mod config;
mod snapshot;
mod stats;
mod tensor;
mod transition;

pub use config::{load_yaml, save_yaml};
pub use replay_buffer::{PerConfig, ReplayBuffer, ReplayBufferConfig};
pub use error::TandemError;
pub use snapshot::{polyak_update, Snapshot};
pub use stats::RunningStat;
pub use tensor::TensorData;
pub use transition::{Episode, SampledBatch, TensorMap, Transition, TransitionBatch};

/// Key under which observations are stored in a transition's tensor maps.
pub const STATE_KEY: &str = "state";

/// Key under which actions are stored in a transition's tensor maps.
pub const ACTION_KEY: &str = "action";

/// Key under which on-policy algorithms store the log-probability of the
/// taken action in a transition's `extra` map.
pub const ACTION_LOG_PROB_KEY: &str = "action_log_prob";
