//! Interfaces of neural networks and their owning handle.
mod base;
mod config;
mod handle;
pub use base::{SubModel, SubModel2};
pub use config::ModelConfig;
pub use handle::ModelHandle;
