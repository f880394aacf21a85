#![warn(missing_docs)]
//! Update engines implemented with tch-rs.
//!
//! Every engine follows the same cycle: sample experience, compute
//! losses, step the optimizers, blend target networks, and publish fresh
//! parameters when a [`SyncController`] is attached. The data model and
//! replay buffers come from `tandem-core`; coordination comes from
//! `tandem-dist`; this crate owns everything that touches a
//! [`tch::Tensor`].
//!
//! [`SyncController`]: tandem_dist::SyncController
pub mod ars;
pub mod ddpg;
pub mod dqn;
pub mod maddpg;
pub mod model;
pub mod ppo;
pub mod util;

mod mlp;
mod noise;
mod opt;

pub use mlp::{Mlp, MlpConfig, OutActivation};
pub use noise::{ActionNoise, NoiseMode};
pub use opt::{Optimizer, OptimizerConfig};
