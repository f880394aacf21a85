use super::{ModelConfig, SubModel};
use crate::{
    opt::{Optimizer, OptimizerConfig},
    util::{from_tensor, to_tensor},
};
use anyhow::Result;
use log::trace;
use tandem_core::{Snapshot, TandemError};
use tandem_dist::SyncModel;
use tch::{nn::VarStore, Device, Tensor};

/// Owns one network: its [`VarStore`], device, and optimizer.
///
/// Target networks are created with [`try_clone`](Self::try_clone),
/// which copies the variables into a fresh store. Parameter exchange
/// with the coordination layer goes through the [`SyncModel`]
/// implementation; snapshot capture and load both run under `no_grad`
/// and copy the whole variable map, so observers never see a half
/// written set of parameters.
pub struct ModelHandle<M: SubModel> {
    device: Device,
    var_store: VarStore,
    net: M,
    opt_config: OptimizerConfig,
    opt: Optimizer,
}

impl<M: SubModel> ModelHandle<M> {
    /// Builds the network and its optimizer on `device`.
    pub fn build(config: ModelConfig<M::Config>, device: Device) -> Result<Self> {
        let var_store = VarStore::new(device);
        let net = M::build(&var_store, config.net_config);
        let opt = config.opt_config.build(&var_store)?;

        Ok(Self {
            device,
            var_store,
            net,
            opt_config: config.opt_config,
            opt,
        })
    }

    /// Clones the network into a fresh [`VarStore`], copying the
    /// current variable values. The clone gets its own optimizer state.
    pub fn try_clone(&self) -> Result<Self> {
        let mut var_store = VarStore::new(self.device);
        let net = self.net.clone_with_var_store(&var_store);
        var_store.copy(&self.var_store)?;
        let opt = self.opt_config.build(&var_store)?;

        Ok(Self {
            device: self.device,
            var_store,
            net,
            opt_config: self.opt_config.clone(),
            opt,
        })
    }

    /// Performs forward computation given an input.
    pub fn forward(&self, input: &M::Input) -> M::Output {
        self.net.forward(input)
    }

    /// Trains the network given a loss.
    pub fn backward_step(&mut self, loss: &Tensor) {
        self.opt.backward_step(loss);
    }

    /// The device the variables live on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the variable store.
    pub fn var_store(&self) -> &VarStore {
        &self.var_store
    }

    /// Returns the variable store as a mutable reference.
    pub fn var_store_mut(&mut self) -> &mut VarStore {
        &mut self.var_store
    }
}

impl<M: SubModel> SyncModel for ModelHandle<M> {
    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        tch::no_grad(|| {
            for (name, tensor) in self.var_store.variables() {
                snapshot.insert(&name, from_tensor(&tensor));
            }
        });
        snapshot
    }

    fn load_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let mut variables = self.var_store.variables();
        if variables.len() != snapshot.len() {
            return Err(TandemError::SnapshotMismatch(format!(
                "snapshot has {} tensors, the model has {} variables",
                snapshot.len(),
                variables.len()
            ))
            .into());
        }
        tch::no_grad(|| -> Result<()> {
            for (name, tensor) in variables.iter_mut() {
                let src = snapshot.get(name).ok_or_else(|| {
                    TandemError::SnapshotMismatch(format!("missing tensor {}", name))
                })?;
                if src.shape() != tensor.size().as_slice() {
                    return Err(TandemError::SnapshotMismatch(format!(
                        "tensor {} has shape {:?}, expected {:?}",
                        name,
                        src.shape(),
                        tensor.size()
                    ))
                    .into());
                }
                tensor.copy_(&to_tensor(src, self.device));
            }
            Ok(())
        })?;
        trace!("loaded snapshot of {} tensors", snapshot.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mlp, MlpConfig};
    use tch::Kind;

    fn handle() -> ModelHandle<Mlp> {
        let config = ModelConfig::new(MlpConfig::new(3, vec![8], 2));
        ModelHandle::build(config, Device::Cpu).unwrap()
    }

    #[test]
    fn snapshot_roundtrips_through_a_var_store() {
        let a = handle();
        let mut b = handle();
        b.load_snapshot(&a.snapshot()).unwrap();

        let x = Tensor::randn(&[4, 3], (Kind::Float, Device::Cpu));
        let ya = a.forward(&x);
        let yb = b.forward(&x);
        assert!(ya.allclose(&yb, 1e-6, 1e-6, false));
    }

    #[test]
    fn try_clone_copies_parameters() {
        let a = handle();
        let b = a.try_clone().unwrap();
        assert!(a.snapshot().allclose(&b.snapshot(), 1e-6));
    }

    #[test]
    fn load_rejects_a_mismatched_snapshot() {
        let mut a = handle();
        let mut snapshot = a.snapshot();
        snapshot.insert("stray", tandem_core::TensorData::scalar(0.0));
        assert!(a.load_snapshot(&snapshot).is_err());
    }
}
