//! Utilities.
use crate::model::{ModelHandle, SubModel};
use anyhow::Result;
use log::trace;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use tandem_core::TensorData;
use tch::{Device, Kind, Tensor};

/// Critic loss type.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum CriticLoss {
    /// Mean squared error.
    Mse,

    /// Smooth L1 loss.
    SmoothL1,
}

impl CriticLoss {
    pub(crate) fn loss(&self, pred: &Tensor, tgt: &Tensor) -> Tensor {
        match self {
            CriticLoss::Mse => pred.mse_loss(tgt, tch::Reduction::Mean),
            CriticLoss::SmoothL1 => pred.smooth_l1_loss(tgt, tch::Reduction::Mean, 1.0),
        }
    }
}

/// Gates which parts of an update run.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct UpdateFlags {
    /// Step the value networks.
    pub update_value: bool,

    /// Step the policy networks.
    pub update_policy: bool,

    /// Blend the target networks toward the online ones.
    pub update_target: bool,
}

impl Default for UpdateFlags {
    fn default() -> Self {
        Self {
            update_value: true,
            update_policy: true,
            update_target: true,
        }
    }
}

impl UpdateFlags {
    /// Sets whether value networks are stepped.
    pub fn update_value(mut self, v: bool) -> Self {
        self.update_value = v;
        self
    }

    /// Sets whether policy networks are stepped.
    pub fn update_policy(mut self, v: bool) -> Self {
        self.update_policy = v;
        self
    }

    /// Sets whether target networks are blended.
    pub fn update_target(mut self, v: bool) -> Self {
        self.update_target = v;
        self
    }
}

/// Losses reported by one update call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateReport {
    /// Mean critic (value) loss, when the value networks were stepped.
    pub loss_critic: Option<f32>,

    /// Mean actor (policy) loss, when the policy networks were stepped.
    pub loss_actor: Option<f32>,
}

/// Apply soft update on variables.
///
/// Variables are identified by their names.
///
/// dest = tau * src + (1.0 - tau) * dest
pub fn track<M: SubModel>(dest: &mut ModelHandle<M>, src: &ModelHandle<M>, tau: f64) {
    let src = src.var_store().variables();
    let mut dest = dest.var_store().variables();
    debug_assert_eq!(src.len(), dest.len());

    tch::no_grad(|| {
        for (name, src) in src.iter() {
            if let Some(dest) = dest.get_mut(name) {
                dest.copy_(&(tau * src + (1.0 - tau) * &*dest));
            }
        }
    });
    trace!("soft update");
}

/// Copies tensor data onto a device.
pub fn to_tensor(data: &TensorData, device: Device) -> Tensor {
    Tensor::from_slice(data.data())
        .reshape(data.shape())
        .to(device)
}

/// Copies a tensor back into backend-free form.
pub fn from_tensor(t: &Tensor) -> TensorData {
    let shape = t.size();
    let flat = t.to_device(Device::Cpu).to_kind(Kind::Float).reshape(&[-1]);
    let data = Vec::<f32>::try_from(&flat).expect("Failed to convert Tensor to Vec<f32>");
    TensorData::new(shape, data).expect("tensor shape matches its data length")
}

/// Builds a batch tensor of rewards or other per-transition scalars.
pub(crate) fn scalars_to_tensor(v: &[f32], device: Device) -> Tensor {
    Tensor::from_slice(v).to(device)
}

/// Builds a batch tensor of terminal flags as 0/1 floats.
pub(crate) fn terminals_to_tensor(v: &[bool], device: Device) -> Tensor {
    let v: Vec<f32> = v.iter().map(|&d| d as u8 as f32).collect();
    Tensor::from_slice(&v).to(device)
}

/// Looks up one named part of a concatenated batch as a device tensor.
pub(crate) fn batch_part(
    map: &tandem_core::TensorMap,
    key: &str,
    device: Device,
) -> Result<Tensor> {
    let data = map
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("batch has no {} entry", key))?;
    Ok(to_tensor(data, device))
}

/// Parses a device name, `"cpu"` or `"cuda:<index>"`.
pub fn parse_device(name: &str) -> Result<Device> {
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    if let Some(index) = name.strip_prefix("cuda:") {
        if let Ok(index) = index.parse() {
            return Ok(Device::Cuda(index));
        }
    }
    Err(anyhow::anyhow!("unknown device {}", name))
}
