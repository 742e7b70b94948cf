//! Network weight arena
//!
//! Every trainable network tensor lives in a [`ParamStore`] and is addressed
//! by a [`ParamId`]. Gradients use a store of identical layout, so optimizer
//! steps, snapshots and finite-difference probes are plain index walks.

use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Handle to a tensor in a [`ParamStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A group of tensors updated together by one optimizer
pub trait ParameterGroup {
    fn tensors(&self) -> Vec<ArrayView2<'_, f64>>;

    fn tensors_mut(&mut self) -> Vec<ArrayViewMut2<'_, f64>>;

    fn num_elements(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }

    fn is_finite(&self) -> bool {
        self.tensors().iter().all(|t| t.iter().all(|v| v.is_finite()))
    }

    fn sq_norm(&self) -> f64 {
        self.tensors().iter().map(|t| t.iter().map(|v| v * v).sum::<f64>()).sum()
    }

    /// `self += alpha * other`
    fn add_scaled(&mut self, other: &Self, alpha: f64)
    where
        Self: Sized,
    {
        let sources = other.tensors();
        for (mut dst, src) in self.tensors_mut().into_iter().zip(sources) {
            Zip::from(&mut dst).and(&src).for_each(|d, &s| *d += alpha * s);
        }
    }

    fn scale(&mut self, factor: f64) {
        for mut t in self.tensors_mut() {
            t.mapv_inplace(|v| v * factor);
        }
    }

    /// Largest absolute elementwise difference to another group of the same layout
    fn max_abs_diff(&self, other: &Self) -> f64
    where
        Self: Sized,
    {
        self.tensors()
            .iter()
            .zip(other.tensors().iter())
            .flat_map(|(a, b)| a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).collect::<Vec<_>>())
            .fold(0.0, f64::max)
    }
}

/// Arena of named network weight matrices
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamStore {
    tensors: Vec<Array2<f64>>,
    names: Vec<String>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor and return its handle
    pub fn register(&mut self, name: impl Into<String>, tensor: Array2<f64>) -> ParamId {
        self.tensors.push(tensor);
        self.names.push(name.into());
        ParamId(self.tensors.len() - 1)
    }

    /// Glorot-uniform `[n_in, n_out]` weight matrix
    pub fn register_glorot(
        &mut self,
        name: impl Into<String>,
        n_in: usize,
        n_out: usize,
        rng: &mut impl Rng,
    ) -> ParamId {
        let scale = (2.0 / (n_in + n_out) as f64).sqrt();
        let w = Array2::from_shape_fn((n_in, n_out), |_| rng.gen::<f64>() * 2.0 * scale - scale);
        self.register(name, w)
    }

    /// Zero `[1, n]` bias row
    pub fn register_bias(&mut self, name: impl Into<String>, n: usize) -> ParamId {
        self.register(name, Array2::zeros((1, n)))
    }

    pub fn get(&self, id: ParamId) -> &Array2<f64> {
        &self.tensors[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut Array2<f64> {
        &mut self.tensors[id.0]
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.names[id.0]
    }

    /// Add `grad` into the tensor at `id`
    pub fn accumulate(&mut self, id: ParamId, grad: &Array2<f64>) {
        self.tensors[id.0] += grad;
    }

    /// Store of the same layout filled with zeros
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self.tensors.iter().map(|t| Array2::zeros(t.raw_dim())).collect(),
            names: self.names.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> {
        (0..self.tensors.len()).map(ParamId)
    }
}

impl ParameterGroup for ParamStore {
    fn tensors(&self) -> Vec<ArrayView2<'_, f64>> {
        self.tensors.iter().map(|t| t.view()).collect()
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMut2<'_, f64>> {
        self.tensors.iter_mut().map(|t| t.view_mut()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_register_and_zeros_like() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut store = ParamStore::new();
        let w = store.register_glorot("w", 4, 3, &mut rng);
        let b = store.register_bias("b", 3);
        assert_eq!(store.get(w).dim(), (4, 3));
        assert_eq!(store.get(b).dim(), (1, 3));
        assert_eq!(store.name(w), "w");
        assert_eq!(store.num_elements(), 15);

        let zeros = store.zeros_like();
        assert_eq!(zeros.sq_norm(), 0.0);
        assert_eq!(zeros.get(w).dim(), (4, 3));
    }

    #[test]
    fn test_add_scaled_and_diff() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let mut store = ParamStore::new();
        store.register_glorot("w", 2, 2, &mut rng);
        let original = store.clone();
        let mut ones = store.zeros_like();
        ones.tensors_mut().into_iter().for_each(|mut t| t.fill(1.0));

        store.add_scaled(&ones, 0.5);
        assert!((store.max_abs_diff(&original) - 0.5).abs() < 1e-12);
        store.add_scaled(&ones, -0.5);
        assert!(store.max_abs_diff(&original) < 1e-12);
    }
}
