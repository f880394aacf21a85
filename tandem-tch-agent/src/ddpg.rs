//! DDPG update engine.
mod base;
mod config;
pub use base::Ddpg;
pub use config::DdpgConfig;
