//! Candidate operations for fusion edges
//!
//! Every operation maps a `[B, C, L]` representation to `[B, C, L]`.
//! Parameterized operations mix channels at each length position; the
//! convolution additionally looks one position to each side.

use ndarray::{Array2, Array3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::params::{ParamId, ParamStore};
use crate::tensor::{from_rows, shift_length, sigmoid, to_rows};

/// Types of operations an edge can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeOp {
    /// Output is zero (edge effectively absent)
    Zero,
    /// Skip connection
    Identity,
    /// 1x1 channel mixing followed by ReLU
    PointwiseReLU,
    /// Width-3 same-padded convolution followed by ReLU
    Conv3ReLU,
    /// Gated linear unit: `(W1 x) * sigmoid(W2 x)`
    GatedLinear,
}

impl EdgeOp {
    /// The fixed candidate menu, in operation-index order
    pub const ALL: [EdgeOp; 5] = [
        EdgeOp::Zero,
        EdgeOp::Identity,
        EdgeOp::PointwiseReLU,
        EdgeOp::Conv3ReLU,
        EdgeOp::GatedLinear,
    ];

    pub fn count() -> usize {
        Self::ALL.len()
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            EdgeOp::Zero => "zero",
            EdgeOp::Identity => "identity",
            EdgeOp::PointwiseReLU => "pointwise_relu",
            EdgeOp::Conv3ReLU => "conv3_relu",
            EdgeOp::GatedLinear => "gated_linear",
        }
    }

    pub fn is_parameterized(self) -> bool {
        !matches!(self, EdgeOp::Zero | EdgeOp::Identity)
    }
}

impl fmt::Display for EdgeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
enum OpParams {
    None,
    Linear { w: ParamId, b: ParamId },
    Conv { taps: [ParamId; 3], b: ParamId },
    Gated { w: ParamId, b: ParamId, w_gate: ParamId, b_gate: ParamId },
}

/// Intermediate values kept for the backward pass
#[derive(Debug, Clone)]
pub enum OpCache {
    Zero,
    Identity,
    Linear { rows: Array2<f64>, pre: Array2<f64> },
    Conv { shifted: Vec<Array2<f64>>, pre: Array2<f64> },
    Gated { rows: Array2<f64>, value: Array2<f64>, gate: Array2<f64> },
}

/// A concrete operation instance with its weights registered in a store
#[derive(Debug, Clone)]
pub struct Operation {
    kind: EdgeOp,
    params: OpParams,
}

impl Operation {
    /// Register the weights for `kind` at channel width `channels`
    pub fn build(
        kind: EdgeOp,
        channels: usize,
        store: &mut ParamStore,
        rng: &mut impl Rng,
        prefix: &str,
    ) -> Self {
        let c = channels;
        let params = match kind {
            EdgeOp::Zero | EdgeOp::Identity => OpParams::None,
            EdgeOp::PointwiseReLU => OpParams::Linear {
                w: store.register_glorot(format!("{}.pointwise.w", prefix), c, c, rng),
                b: store.register_bias(format!("{}.pointwise.b", prefix), c),
            },
            EdgeOp::Conv3ReLU => OpParams::Conv {
                taps: [
                    store.register_glorot(format!("{}.conv3.w0", prefix), c, c, rng),
                    store.register_glorot(format!("{}.conv3.w1", prefix), c, c, rng),
                    store.register_glorot(format!("{}.conv3.w2", prefix), c, c, rng),
                ],
                b: store.register_bias(format!("{}.conv3.b", prefix), c),
            },
            EdgeOp::GatedLinear => OpParams::Gated {
                w: store.register_glorot(format!("{}.glu.w", prefix), c, c, rng),
                b: store.register_bias(format!("{}.glu.b", prefix), c),
                w_gate: store.register_glorot(format!("{}.glu.w_gate", prefix), c, c, rng),
                b_gate: store.register_bias(format!("{}.glu.b_gate", prefix), c),
            },
        };
        Self { kind, params }
    }

    pub fn kind(&self) -> EdgeOp {
        self.kind
    }

    /// Forward pass; returns the output and the backward cache
    pub fn forward(&self, x: &Array3<f64>, store: &ParamStore) -> (Array3<f64>, OpCache) {
        let (batch, _, length) = x.dim();
        match &self.params {
            OpParams::None => match self.kind {
                EdgeOp::Zero => (Array3::zeros(x.raw_dim()), OpCache::Zero),
                _ => (x.clone(), OpCache::Identity),
            },
            OpParams::Linear { w, b } => {
                let rows = to_rows(x);
                let pre = rows.dot(store.get(*w)) + store.get(*b);
                let out = from_rows(&pre.mapv(|v| v.max(0.0)), batch, length);
                (out, OpCache::Linear { rows, pre })
            }
            OpParams::Conv { taps, b } => {
                // tap k reads position l + k - 1
                let shifted: Vec<Array2<f64>> = (0..3)
                    .map(|k| to_rows(&shift_length(x, k as isize - 1)))
                    .collect();
                let mut pre = Array2::<f64>::zeros((batch * length, x.dim().1)) + store.get(*b);
                for (rows, tap) in shifted.iter().zip(taps.iter()) {
                    pre += &rows.dot(store.get(*tap));
                }
                let out = from_rows(&pre.mapv(|v| v.max(0.0)), batch, length);
                (out, OpCache::Conv { shifted, pre })
            }
            OpParams::Gated { w, b, w_gate, b_gate } => {
                let rows = to_rows(x);
                let value = rows.dot(store.get(*w)) + store.get(*b);
                let gate = (rows.dot(store.get(*w_gate)) + store.get(*b_gate)).mapv(sigmoid);
                let out = from_rows(&(&value * &gate), batch, length);
                (out, OpCache::Gated { rows, value, gate })
            }
        }
    }

    /// Backward pass; accumulates weight gradients and returns the input gradient
    pub fn backward(
        &self,
        grad_out: &Array3<f64>,
        cache: &OpCache,
        store: &ParamStore,
        grads: &mut ParamStore,
    ) -> Array3<f64> {
        let (batch, _, length) = grad_out.dim();
        match (&self.params, cache) {
            (OpParams::None, OpCache::Identity) => grad_out.clone(),
            (OpParams::None, _) => Array3::zeros(grad_out.raw_dim()),
            (OpParams::Linear { w, b }, OpCache::Linear { rows, pre }) => {
                let d_pre = relu_grad(&to_rows(grad_out), pre);
                grads.accumulate(*w, &rows.t().dot(&d_pre));
                grads.accumulate(*b, &d_pre.sum_axis(Axis(0)).insert_axis(Axis(0)));
                from_rows(&d_pre.dot(&store.get(*w).t()), batch, length)
            }
            (OpParams::Conv { taps, b }, OpCache::Conv { shifted, pre }) => {
                let d_pre = relu_grad(&to_rows(grad_out), pre);
                grads.accumulate(*b, &d_pre.sum_axis(Axis(0)).insert_axis(Axis(0)));
                let mut d_in = Array3::zeros(grad_out.raw_dim());
                for (k, (rows, tap)) in shifted.iter().zip(taps.iter()).enumerate() {
                    grads.accumulate(*tap, &rows.t().dot(&d_pre));
                    let d_shifted = from_rows(&d_pre.dot(&store.get(*tap).t()), batch, length);
                    d_in += &shift_length(&d_shifted, 1 - k as isize);
                }
                d_in
            }
            (OpParams::Gated { w, b, w_gate, b_gate }, OpCache::Gated { rows, value, gate }) => {
                let g = to_rows(grad_out);
                let d_value = &g * gate;
                let d_gate_pre = &g * value * gate.mapv(|s| s * (1.0 - s));
                grads.accumulate(*w, &rows.t().dot(&d_value));
                grads.accumulate(*b, &d_value.sum_axis(Axis(0)).insert_axis(Axis(0)));
                grads.accumulate(*w_gate, &rows.t().dot(&d_gate_pre));
                grads.accumulate(*b_gate, &d_gate_pre.sum_axis(Axis(0)).insert_axis(Axis(0)));
                let d_rows = d_value.dot(&store.get(*w).t()) + d_gate_pre.dot(&store.get(*w_gate).t());
                from_rows(&d_rows, batch, length)
            }
            _ => unreachable!("operation cache does not match operation kind {}", self.kind),
        }
    }
}

fn relu_grad(grad: &Array2<f64>, pre: &Array2<f64>) -> Array2<f64> {
    let mut d = grad.clone();
    d.zip_mut_with(pre, |g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::params::ParameterGroup;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn input(rng: &mut Xoshiro256PlusPlus) -> Array3<f64> {
        Array3::from_shape_fn((2, 3, 4), |_| rng.gen::<f64>() * 2.0 - 1.0)
    }

    /// Loss = sum(out * probe); checks input and weight gradients numerically
    fn check_gradients(kind: EdgeOp) {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let mut store = ParamStore::new();
        let op = Operation::build(kind, 3, &mut store, &mut rng, "op");
        let x = input(&mut rng);
        let probe = input(&mut rng);

        let loss = |store: &ParamStore, x: &Array3<f64>| (op.forward(x, store).0 * &probe).sum();

        let (_, cache) = op.forward(&x, &store);
        let mut grads = store.zeros_like();
        let d_in = op.backward(&probe, &cache, &store, &mut grads);

        let eps = 1e-6;
        for idx in [[0, 0, 0], [1, 2, 3], [0, 1, 2]] {
            let mut plus = x.clone();
            plus[idx] += eps;
            let mut minus = x.clone();
            minus[idx] -= eps;
            let fd = (loss(&store, &plus) - loss(&store, &minus)) / (2.0 * eps);
            assert!((fd - d_in[idx]).abs() < 1e-5, "{}: input grad {} vs {}", kind, d_in[idx], fd);
        }

        for id in store.ids() {
            let mut plus = store.clone();
            plus.get_mut(id)[[0, 0]] += eps;
            let mut minus = store.clone();
            minus.get_mut(id)[[0, 0]] -= eps;
            let fd = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps);
            let analytic = grads.get(id)[[0, 0]];
            assert!((fd - analytic).abs() < 1e-5, "{}: {} grad {} vs {}", kind, store.name(id), analytic, fd);
        }
    }

    #[test]
    fn test_op_indices_are_stable() {
        for (i, op) in EdgeOp::ALL.iter().enumerate() {
            assert_eq!(op.index(), i);
            assert_eq!(EdgeOp::from_index(i), Some(*op));
        }
        assert_eq!(EdgeOp::from_index(EdgeOp::count()), None);
    }

    #[test]
    fn test_zero_and_identity() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let mut store = ParamStore::new();
        let x = input(&mut rng);
        let zero = Operation::build(EdgeOp::Zero, 3, &mut store, &mut rng, "z");
        let identity = Operation::build(EdgeOp::Identity, 3, &mut store, &mut rng, "i");
        assert!(store.is_empty());
        assert!(zero.forward(&x, &store).0.iter().all(|&v| v == 0.0));
        assert_eq!(identity.forward(&x, &store).0, x);
    }

    #[test]
    fn test_parameterized_shapes() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);
        let mut store = ParamStore::new();
        let x = input(&mut rng);
        for kind in [EdgeOp::PointwiseReLU, EdgeOp::Conv3ReLU, EdgeOp::GatedLinear] {
            let op = Operation::build(kind, 3, &mut store, &mut rng, kind.name());
            assert_eq!(op.forward(&x, &store).0.dim(), x.dim());
        }
        assert_eq!(store.num_elements(), (9 + 3) + (27 + 3) + 2 * (9 + 3));
    }

    #[test]
    fn test_pointwise_gradients() {
        check_gradients(EdgeOp::PointwiseReLU);
    }

    #[test]
    fn test_conv_gradients() {
        check_gradients(EdgeOp::Conv3ReLU);
    }

    #[test]
    fn test_gated_gradients() {
        check_gradients(EdgeOp::GatedLinear);
    }

    #[test]
    fn test_identity_gradients() {
        check_gradients(EdgeOp::Identity);
    }
}
