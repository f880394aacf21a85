//! Multi-agent DDPG update engine.
mod base;
mod config;
pub use base::Maddpg;
pub use config::MaddpgConfig;

/// Key of agent `i`'s observation in a joint transition.
pub fn state_key(i: usize) -> String {
    format!("state_{}", i)
}

/// Key of agent `i`'s action in a joint transition.
pub fn action_key(i: usize) -> String {
    format!("action_{}", i)
}

/// Key of agent `i`'s reward in a joint transition's extra map. When
/// absent, the transition's shared reward is used.
pub fn reward_key(i: usize) -> String {
    format!("reward_{}", i)
}
