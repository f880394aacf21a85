//! Streaming statistics for observation normalization.
use crate::{TandemError, TensorData};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Elementwise running mean and variance (Welford's update).
///
/// Gradient-free methods normalize observations with it and merge the
/// per-worker statistics when workers exchange progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunningStat {
    shape: Vec<i64>,
    n: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RunningStat {
    /// Creates statistics for values of the given shape.
    pub fn new(shape: &[i64]) -> Self {
        let numel: i64 = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            n: 0,
            mean: vec![0.0; numel as usize],
            m2: vec![0.0; numel as usize],
        }
    }

    /// Number of observed values.
    pub fn count(&self) -> u64 {
        self.n
    }

    /// Shape of the tracked values.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Folds one observation into the statistics.
    pub fn push(&mut self, x: &TensorData) -> Result<()> {
        if x.shape() != &self.shape[..] {
            return Err(TandemError::SnapshotMismatch(format!(
                "running stat of shape {:?} fed {:?}",
                self.shape,
                x.shape()
            ))
            .into());
        }
        self.n += 1;
        let n = self.n as f64;
        for (i, &v) in x.data().iter().enumerate() {
            let v = v as f64;
            let delta = v - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (v - self.mean[i]);
        }
        Ok(())
    }

    /// Merges another set of statistics into this one (parallel Welford).
    pub fn update(&mut self, other: &RunningStat) {
        debug_assert_eq!(self.shape, other.shape);
        if other.n == 0 {
            return;
        }
        if self.n == 0 {
            *self = other.clone();
            return;
        }
        let (na, nb) = (self.n as f64, other.n as f64);
        let n = na + nb;
        for i in 0..self.mean.len() {
            let delta = other.mean[i] - self.mean[i];
            self.mean[i] += delta * nb / n;
            self.m2[i] += other.m2[i] + delta * delta * na * nb / n;
        }
        self.n += other.n;
    }

    /// Elementwise mean of the observed values.
    pub fn mean(&self) -> TensorData {
        let data = self.mean.iter().map(|&v| v as f32).collect();
        TensorData::new(self.shape.clone(), data).expect("shape fixed at construction")
    }

    /// Unbiased elementwise variance. With a single observation the
    /// square of the mean is returned, matching the convention of the
    /// reference filters this normalizer replaces.
    pub fn var(&self) -> TensorData {
        let data = if self.n <= 1 {
            self.mean.iter().map(|&m| (m * m) as f32).collect()
        } else {
            self.m2
                .iter()
                .map(|&m2| (m2 / (self.n as f64 - 1.0)) as f32)
                .collect()
        };
        TensorData::new(self.shape.clone(), data).expect("shape fixed at construction")
    }

    /// Elementwise standard deviation.
    pub fn std(&self) -> TensorData {
        let mut v = self.var();
        for e in v.data_mut() {
            *e = e.sqrt();
        }
        v
    }

    /// Returns `(x - mean) / (std + eps)`.
    pub fn normalize(&self, x: &TensorData, eps: f32) -> Result<TensorData> {
        if x.shape() != &self.shape[..] {
            return Err(TandemError::SnapshotMismatch(format!(
                "running stat of shape {:?} normalizing {:?}",
                self.shape,
                x.shape()
            ))
            .into());
        }
        let std = self.std();
        let data = x
            .data()
            .iter()
            .enumerate()
            .map(|(i, &v)| (v - self.mean[i] as f32) / (std.data()[i] + eps))
            .collect();
        TensorData::new(self.shape.clone(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn td(vals: &[f32]) -> TensorData {
        TensorData::new(vec![vals.len() as i64], vals.to_vec()).unwrap()
    }

    #[test]
    fn mean_and_var_match_batch_statistics() {
        let mut rs = RunningStat::new(&[2]);
        let samples = [[1.0f32, -2.0], [3.0, 0.0], [5.0, 2.0], [-1.0, 4.0]];
        for s in &samples {
            rs.push(&td(s)).unwrap();
        }
        // mean = [2.0, 1.0]; unbiased var = [6.666.., 6.666..]
        assert!(rs.mean().allclose(&td(&[2.0, 1.0]), 1e-6));
        assert!(rs.var().allclose(&td(&[20.0 / 3.0, 20.0 / 3.0]), 1e-5));
    }

    #[test]
    fn single_observation_var_is_square_of_mean() {
        let mut rs = RunningStat::new(&[2]);
        rs.push(&td(&[3.0, -4.0])).unwrap();
        assert!(rs.var().allclose(&td(&[9.0, 16.0]), 1e-6));
    }

    #[test]
    fn update_merges_like_one_stream() {
        let mut a = RunningStat::new(&[1]);
        let mut b = RunningStat::new(&[1]);
        let mut whole = RunningStat::new(&[1]);
        for k in 0..5 {
            let x = td(&[k as f32 * 1.5 - 2.0]);
            a.push(&x).unwrap();
            whole.push(&x).unwrap();
        }
        for k in 0..9 {
            let x = td(&[k as f32 * -0.5 + 1.0]);
            b.push(&x).unwrap();
            whole.push(&x).unwrap();
        }
        a.update(&b);
        assert_eq!(a.count(), whole.count());
        assert!(a.mean().allclose(&whole.mean(), 1e-5));
        assert!(a.std().allclose(&whole.std(), 1e-5));
    }

    #[test]
    fn push_rejects_wrong_shape() {
        let mut rs = RunningStat::new(&[3]);
        assert!(rs.push(&td(&[1.0, 2.0])).is_err());
    }
}
