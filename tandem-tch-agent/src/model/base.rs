//! Definition of interfaces of neural networks.
use tch::nn::VarStore;

/// Neural network that can be initialized with a [`VarStore`] and a
/// configuration.
///
/// Modules composing a network share a [`VarStore`], so structs
/// implementing this trait are built against a given store. The trait
/// also provides cloning into a fresh store, which is how target
/// networks are created.
///
/// [`VarStore`]: https://docs.rs/tch/0.16.0/tch/nn/struct.VarStore.html
pub trait SubModel {
    /// Configuration from which the network is constructed.
    type Config;

    /// Input of the network.
    type Input;

    /// Output of the network.
    type Output;

    /// Builds the network with a [`VarStore`] and a configuration.
    fn build(var_store: &VarStore, config: Self::Config) -> Self;

    /// Clones the network with a given [`VarStore`].
    fn clone_with_var_store(&self, var_store: &VarStore) -> Self;

    /// A generalized forward function.
    fn forward(&self, input: &Self::Input) -> Self::Output;
}

/// Neural network taking two inputs, typically observation and action.
///
/// The difference from [`SubModel`] is the arity of `forward`.
pub trait SubModel2 {
    /// Configuration from which the network is constructed.
    type Config;

    /// First input of the network.
    type Input1;

    /// Second input of the network.
    type Input2;

    /// Output of the network.
    type Output;

    /// Builds the network with a [`VarStore`] and a configuration.
    fn build(var_store: &VarStore, config: Self::Config) -> Self;

    /// Clones the network with a given [`VarStore`].
    fn clone_with_var_store(&self, var_store: &VarStore) -> Self;

    /// A generalized forward function.
    fn forward(&self, input1: &Self::Input1, input2: &Self::Input2) -> Self::Output;
}
