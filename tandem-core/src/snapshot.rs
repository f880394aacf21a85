//! Model snapshots: named parameter tensors at a point in time.
use crate::{TandemError, TensorData};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A complete, self-consistent copy of one model's parameters.
///
/// Snapshots are what moves between workers and the parameter server and
/// what gets persisted to disk. They are plain host memory, so handing a
/// snapshot to another thread never shares live autograd state.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    tensors: BTreeMap<String, TensorData>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a named parameter tensor.
    pub fn insert(&mut self, name: &str, tensor: TensorData) {
        self.tensors.insert(name.to_string(), tensor);
    }

    /// Looks up a parameter tensor by name.
    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name)
    }

    /// Number of parameter tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Returns true if no parameters are stored.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterates parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TensorData)> {
        self.tensors.iter()
    }

    /// Mutably iterates parameters in name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut TensorData)> {
        self.tensors.iter_mut()
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Returns true if both snapshots have the same names and every
    /// tensor is elementwise within `tol`.
    pub fn allclose(&self, other: &Snapshot, tol: f32) -> bool {
        self.tensors.len() == other.tensors.len()
            && self.tensors.iter().all(|(name, t)| {
                other
                    .tensors
                    .get(name)
                    .map(|o| t.allclose(o, tol))
                    .unwrap_or(false)
            })
    }

    /// Adds `alpha * other` elementwise into `self`.
    ///
    /// Both snapshots must carry the same names and shapes. This is the
    /// direct parameter step used by gradient-free methods.
    pub fn axpy(&mut self, alpha: f32, other: &Snapshot) -> Result<()> {
        if self.tensors.len() != other.tensors.len() {
            return Err(mismatch(self, other));
        }
        for (name, t) in self.tensors.iter_mut() {
            let o = match other.tensors.get(name) {
                Some(o) if o.shape() == t.shape() => o,
                _ => {
                    return Err(TandemError::SnapshotMismatch(format!(
                        "parameter {:?} missing or differently shaped",
                        name
                    ))
                    .into())
                }
            };
            for (a, b) in t.data_mut().iter_mut().zip(o.data().iter()) {
                *a += alpha * b;
            }
        }
        Ok(())
    }
}

fn mismatch(a: &Snapshot, b: &Snapshot) -> anyhow::Error {
    TandemError::SnapshotMismatch(format!(
        "snapshots hold {} and {} parameters",
        a.len(),
        b.len()
    ))
    .into()
}

/// Blends `target` toward `online`: `target = tau*online + (1-tau)*target`.
///
/// `tau = 1` is a hard copy; `tau -> 0` leaves the target unchanged.
/// Both snapshots must carry the same names and shapes.
pub fn polyak_update(target: &mut Snapshot, online: &Snapshot, tau: f32) -> Result<()> {
    if target.len() != online.len() {
        return Err(mismatch(target, online));
    }
    for (name, t) in target.iter_mut() {
        let o = match online.get(name) {
            Some(o) if o.shape() == t.shape() => o,
            _ => {
                return Err(TandemError::SnapshotMismatch(format!(
                    "parameter {:?} missing or differently shaped",
                    name
                ))
                .into())
            }
        };
        for (a, b) in t.data_mut().iter_mut().zip(o.data().iter()) {
            *a = tau * b + (1.0 - tau) * *a;
        }
    }
    Ok(())
}
