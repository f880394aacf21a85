//! Dense tensors used to move data between workers.
use crate::TandemError;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A dense `f32` tensor with explicit shape.
///
/// This is the wire format of the framework: transitions, model
/// snapshots and persisted parameters are all built from it. Compute
/// backends convert to their own tensor types at sample time, so storage
/// never blocks on device transfers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    shape: Vec<i64>,
    data: Vec<f32>,
}

impl TensorData {
    /// Creates a tensor, checking that `data` matches `shape`.
    pub fn new(shape: Vec<i64>, data: Vec<f32>) -> Result<Self> {
        let numel: i64 = shape.iter().product();
        if numel < 0 || numel as usize != data.len() {
            return Err(TandemError::SnapshotMismatch(format!(
                "shape {:?} does not hold {} elements",
                shape,
                data.len()
            ))
            .into());
        }
        Ok(Self { shape, data })
    }

    /// Creates a zero-filled tensor.
    pub fn zeros(shape: &[i64]) -> Self {
        let numel: i64 = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel as usize],
        }
    }

    /// Creates a rank-0 tensor holding a single value.
    pub fn scalar(v: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![v],
        }
    }

    /// The shape of the tensor.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// The elements of the tensor in row-major order.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the elements.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Concatenates tensors along the first (batch) dimension.
    ///
    /// All inputs must have the same rank and identical trailing
    /// dimensions. Rank-0 inputs are treated as shape `[1]`.
    pub fn cat(items: &[&TensorData]) -> Result<TensorData> {
        let first = items
            .first()
            .ok_or_else(|| TandemError::SnapshotMismatch("cat of zero tensors".into()))?;
        let head = if first.shape.is_empty() {
            vec![1]
        } else {
            first.shape.clone()
        };
        let mut rows: i64 = 0;
        let mut data = Vec::new();
        for t in items {
            let shape = if t.shape.is_empty() {
                vec![1]
            } else {
                t.shape.clone()
            };
            if shape[1..] != head[1..] {
                return Err(TandemError::SnapshotMismatch(format!(
                    "cannot concatenate shapes {:?} and {:?}",
                    head, t.shape
                ))
                .into());
            }
            rows += shape[0];
            data.extend_from_slice(&t.data);
        }
        let mut shape = head;
        shape[0] = rows;
        Ok(TensorData { shape, data })
    }

    /// Returns true if both tensors have the same shape and every
    /// element differs by at most `tol`.
    pub fn allclose(&self, other: &TensorData, tol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}

#[cfg(test)]
mod tests {
    use super::TensorData;

    #[test]
    fn new_rejects_shape_mismatch() {
        assert!(TensorData::new(vec![2, 2], vec![0.0; 3]).is_err());
        assert!(TensorData::new(vec![2, 2], vec![0.0; 4]).is_ok());
    }

    #[test]
    fn cat_stacks_along_batch_dim() {
        let a = TensorData::new(vec![1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        let b = TensorData::new(vec![2, 3], vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
        let c = TensorData::cat(&[&a, &b]).unwrap();
        assert_eq!(c.shape(), &[3, 3]);
        assert_eq!(c.data()[3], 4.0);
    }

    #[test]
    fn cat_rejects_trailing_mismatch() {
        let a = TensorData::zeros(&[1, 3]);
        let b = TensorData::zeros(&[1, 4]);
        assert!(TensorData::cat(&[&a, &b]).is_err());
    }

    #[test]
    fn allclose_within_tolerance() {
        let a = TensorData::new(vec![2], vec![1.0, 2.0]).unwrap();
        let b = TensorData::new(vec![2], vec![1.0 + 1e-7, 2.0]).unwrap();
        assert!(a.allclose(&b, 1e-6));
        assert!(!a.allclose(&b, 1e-8));
    }
}
