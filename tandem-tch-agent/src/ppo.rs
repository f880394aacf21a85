//! On-policy advantage actor-critic engine (A2C / PPO-clip / IMPALA-style).
mod base;
mod config;
pub use base::Ppo;
pub use config::{PolicyLoss, PpoConfig};
