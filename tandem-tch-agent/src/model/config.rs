//! Configuration of a model handle.
use crate::opt::OptimizerConfig;
use serde::{Deserialize, Serialize};

/// Configuration of [`ModelHandle`](super::ModelHandle): the network
/// configuration paired with its optimizer.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig<C> {
    /// Configuration of the network itself.
    pub net_config: C,

    /// Configuration of the optimizer over the network's variables.
    pub opt_config: OptimizerConfig,
}

impl<C> ModelConfig<C> {
    /// Creates a model configuration with the default optimizer.
    pub fn new(net_config: C) -> Self {
        Self {
            net_config,
            opt_config: OptimizerConfig::default(),
        }
    }

    /// Sets the optimizer configuration.
    pub fn opt_config(mut self, opt_config: OptimizerConfig) -> Self {
        self.opt_config = opt_config;
        self
    }
}
