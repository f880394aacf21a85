//! Augmented random search update engine.
mod base;
mod config;
pub use base::Ars;
pub use config::ArsConfig;
