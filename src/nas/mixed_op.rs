//! Mixed operation: continuous relaxation of one edge's operation choice

use ndarray::{Array1, Array3, ArrayView1};
use rand::Rng;

use super::ops::{EdgeOp, OpCache, Operation};
use super::params::ParamStore;
use crate::error::{FusionNasError, Result};

/// Backward cache of a [`MixedOp`]
#[derive(Debug, Clone)]
pub struct MixedCache {
    outputs: Vec<Array3<f64>>,
    caches: Vec<OpCache>,
}

/// Weighted sum of every candidate operation applied to the same input
#[derive(Debug, Clone)]
pub struct MixedOp {
    ops: Vec<Operation>,
    channels: usize,
    length: usize,
}

impl MixedOp {
    /// Build one instance of every candidate in [`EdgeOp::ALL`]
    pub fn new(
        channels: usize,
        length: usize,
        store: &mut ParamStore,
        rng: &mut impl Rng,
        prefix: &str,
    ) -> Self {
        let ops = EdgeOp::ALL
            .iter()
            .map(|&kind| Operation::build(kind, channels, store, rng, prefix))
            .collect();
        Self { ops, channels, length }
    }

    /// Candidate operations, in [`EdgeOp::ALL`] order
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Declared `(C, L)` of inputs and outputs
    pub fn shape(&self) -> (usize, usize) {
        (self.channels, self.length)
    }

    fn check(&self, x: &Array3<f64>, weights: ArrayView1<f64>) -> Result<()> {
        let (_, c, l) = x.dim();
        if c != self.channels || l != self.length {
            return Err(FusionNasError::config(format!(
                "mixed operation declared [_, {}, {}] but received [_, {}, {}]",
                self.channels, self.length, c, l
            )));
        }
        if weights.len() != self.ops.len() {
            return Err(FusionNasError::config(format!(
                "expected {} operation weights, got {}",
                self.ops.len(),
                weights.len()
            )));
        }
        Ok(())
    }

    /// `sum_k weights[k] * op_k(x)`; `weights` are already normalized
    pub fn forward(
        &self,
        x: &Array3<f64>,
        weights: ArrayView1<f64>,
        store: &ParamStore,
    ) -> Result<(Array3<f64>, MixedCache)> {
        self.check(x, weights)?;
        let mut out = Array3::zeros(x.raw_dim());
        let mut outputs = Vec::with_capacity(self.ops.len());
        let mut caches = Vec::with_capacity(self.ops.len());
        for (op, &w) in self.ops.iter().zip(weights.iter()) {
            let (y, cache) = op.forward(x, store);
            out.scaled_add(w, &y);
            outputs.push(y);
            caches.push(cache);
        }
        Ok((out, MixedCache { outputs, caches }))
    }

    /// Returns the input gradient and the gradient w.r.t. the (normalized) weights
    pub fn backward(
        &self,
        grad_out: &Array3<f64>,
        weights: ArrayView1<f64>,
        cache: &MixedCache,
        store: &ParamStore,
        grads: &mut ParamStore,
    ) -> (Array3<f64>, Array1<f64>) {
        let mut d_in = Array3::zeros(grad_out.raw_dim());
        let mut d_weights = Array1::zeros(self.ops.len());
        for (k, op) in self.ops.iter().enumerate() {
            d_weights[k] = (grad_out * &cache.outputs[k]).sum();
            if weights[k] != 0.0 {
                let scaled = grad_out * weights[k];
                d_in += &op.backward(&scaled, &cache.caches[k], store, grads);
            }
        }
        (d_in, d_weights)
    }
}
