//! Fusion node
//!
//! A node applies one mixed operation per candidate source, scales each
//! result by the source's keep weight and sums them. With `node_steps > 1`
//! this is repeated; every sub-step adds its aggregate onto the previous
//! sub-step's output, and the last `node_multiplier` sub-step outputs are
//! concatenated and projected back to `C` channels.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use super::mixed_op::{MixedCache, MixedOp};
use super::params::{ParamId, ParamStore};
use crate::error::{FusionNasError, Result};
use crate::tensor::{concat_channels, from_rows, split_channels, to_rows};

#[derive(Debug, Clone)]
struct Projection {
    w: ParamId,
    b: ParamId,
}

/// Backward cache of a [`FusionNode`]
#[derive(Debug, Clone)]
pub struct NodeCache {
    /// `[sub_step][source]` mixed-op outputs before keep scaling
    mixed_outputs: Vec<Vec<Array3<f64>>>,
    mixed_caches: Vec<Vec<MixedCache>>,
    /// Rows of the concatenated sub-step outputs fed to the projection
    projected_rows: Option<Array2<f64>>,
}

/// One internal node of the fusion cell
#[derive(Debug, Clone)]
pub struct FusionNode {
    id: usize,
    num_sources: usize,
    sub_steps: Vec<Vec<MixedOp>>,
    projection: Option<Projection>,
    node_multiplier: usize,
    channels: usize,
}

impl FusionNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        num_sources: usize,
        node_steps: usize,
        node_multiplier: usize,
        channels: usize,
        length: usize,
        store: &mut ParamStore,
        rng: &mut impl Rng,
    ) -> Self {
        let sub_steps = (0..node_steps)
            .map(|t| {
                (0..num_sources)
                    .map(|j| MixedOp::new(channels, length, store, rng, &format!("node{}.step{}.src{}", id, t, j)))
                    .collect()
            })
            .collect();
        let projection = (node_multiplier > 1).then(|| Projection {
            w: store.register_glorot(format!("node{}.proj.w", id), node_multiplier * channels, channels, rng),
            b: store.register_bias(format!("node{}.proj.b", id), channels),
        });
        Self {
            id,
            num_sources,
            sub_steps,
            projection,
            node_multiplier,
            channels,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_sources(&self) -> usize {
        self.num_sources
    }

    pub fn node_steps(&self) -> usize {
        self.sub_steps.len()
    }

    fn check(&self, sources: &[&Array3<f64>], keep: ArrayView1<f64>, op_weights: ArrayView2<f64>) -> Result<()> {
        if sources.len() != self.num_sources || keep.len() != self.num_sources || op_weights.nrows() != self.num_sources {
            return Err(FusionNasError::config(format!(
                "node {} has {} candidate sources, got {} sources / {} keep weights / {} op weight rows",
                self.id,
                self.num_sources,
                sources.len(),
                keep.len(),
                op_weights.nrows()
            )));
        }
        Ok(())
    }

    /// Forward pass with normalized keep and operation weights
    pub fn forward(
        &self,
        sources: &[&Array3<f64>],
        keep: ArrayView1<f64>,
        op_weights: ArrayView2<f64>,
        store: &ParamStore,
    ) -> Result<(Array3<f64>, NodeCache)> {
        self.check(sources, keep, op_weights)?;

        let mut states: Vec<Array3<f64>> = Vec::with_capacity(self.sub_steps.len());
        let mut mixed_outputs = Vec::with_capacity(self.sub_steps.len());
        let mut mixed_caches = Vec::with_capacity(self.sub_steps.len());
        for step_ops in &self.sub_steps {
            let mut h = match states.last() {
                Some(prev) => prev.clone(),
                None => Array3::zeros(sources[0].raw_dim()),
            };
            let mut outs = Vec::with_capacity(self.num_sources);
            let mut caches = Vec::with_capacity(self.num_sources);
            for (j, mixed) in step_ops.iter().enumerate() {
                let (y, cache) = mixed.forward(sources[j], op_weights.row(j), store)?;
                h.scaled_add(keep[j], &y);
                outs.push(y);
                caches.push(cache);
            }
            states.push(h);
            mixed_outputs.push(outs);
            mixed_caches.push(caches);
        }

        let (out, projected_rows) = match &self.projection {
            None => (states.pop().unwrap_or_default(), None),
            Some(proj) => {
                let tail: Vec<&Array3<f64>> = states[states.len() - self.node_multiplier..].iter().collect();
                let (batch, _, length) = tail[0].dim();
                let rows = to_rows(&concat_channels(&tail));
                let out = from_rows(&(rows.dot(store.get(proj.w)) + store.get(proj.b)), batch, length);
                (out, Some(rows))
            }
        };

        Ok((
            out,
            NodeCache {
                mixed_outputs,
                mixed_caches,
                projected_rows,
            },
        ))
    }

    /// Returns gradients w.r.t. each source, the keep weights and the operation weights
    pub fn backward(
        &self,
        grad_out: &Array3<f64>,
        keep: ArrayView1<f64>,
        op_weights: ArrayView2<f64>,
        cache: &NodeCache,
        store: &ParamStore,
        grads: &mut ParamStore,
    ) -> (Vec<Array3<f64>>, Array1<f64>, Array2<f64>) {
        let steps = self.sub_steps.len();
        let mut d_states: Vec<Array3<f64>> = vec![Array3::zeros(grad_out.raw_dim()); steps];

        match (&self.projection, &cache.projected_rows) {
            (Some(proj), Some(rows)) => {
                let (batch, _, length) = grad_out.dim();
                let d_pre = to_rows(grad_out);
                grads.accumulate(proj.w, &rows.t().dot(&d_pre));
                grads.accumulate(proj.b, &d_pre.sum_axis(Axis(0)).insert_axis(Axis(0)));
                let d_concat = from_rows(&d_pre.dot(&store.get(proj.w).t()), batch, length);
                let first = steps - self.node_multiplier;
                for (i, part) in split_channels(&d_concat, self.channels, self.node_multiplier).into_iter().enumerate() {
                    d_states[first + i] += &part;
                }
            }
            _ => d_states[steps - 1] += grad_out,
        }

        let mut d_sources: Vec<Array3<f64>> = vec![Array3::zeros(grad_out.raw_dim()); self.num_sources];
        let mut d_keep = Array1::zeros(self.num_sources);
        let mut d_ops = Array2::zeros((self.num_sources, op_weights.ncols()));
        for t in (0..steps).rev() {
            let d_h = d_states[t].clone();
            if t > 0 {
                d_states[t - 1] += &d_h;
            }
            for (j, mixed) in self.sub_steps[t].iter().enumerate() {
                d_keep[j] += (&d_h * &cache.mixed_outputs[t][j]).sum();
                let d_mixed = &d_h * keep[j];
                let (d_src, d_w) = mixed.backward(&d_mixed, op_weights.row(j), &cache.mixed_caches[t][j], store, grads);
                d_sources[j] += &d_src;
                let mut row = d_ops.row_mut(j);
                row += &d_w;
            }
        }
        (d_sources, d_keep, d_ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::softmax;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn sources(rng: &mut Xoshiro256PlusPlus, n: usize) -> Vec<Array3<f64>> {
        (0..n)
            .map(|_| Array3::from_shape_fn((2, 3, 4), |_| rng.gen::<f64>() - 0.5))
            .collect()
    }

    fn weights(rng: &mut Xoshiro256PlusPlus, n: usize) -> (Array1<f64>, Array2<f64>) {
        let keep = softmax(Array1::from_shape_fn(n, |_| rng.gen::<f64>()).view());
        let mut ops = Array2::from_shape_fn((n, 5), |_| rng.gen::<f64>());
        for mut row in ops.rows_mut() {
            let p = softmax(row.view());
            row.assign(&p);
        }
        (keep, ops)
    }

    #[test]
    fn test_single_step_is_keep_weighted_sum() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        let mut store = ParamStore::new();
        let node = FusionNode::new(0, 3, 1, 1, 3, 4, &mut store, &mut rng);
        let srcs = sources(&mut rng, 3);
        let refs: Vec<&Array3<f64>> = srcs.iter().collect();
        // identity-only operations: output is the keep-weighted sum of sources
        let keep = Array1::from(vec![0.5, 0.3, 0.2]);
        let mut ops = Array2::zeros((3, 5));
        ops.column_mut(1).fill(1.0);
        let (out, _) = node.forward(&refs, keep.view(), ops.view(), &store).unwrap();
        let expected = &srcs[0] * 0.5 + &srcs[1] * 0.3 + &srcs[2] * 0.2;
        assert!(out.iter().zip(expected.iter()).all(|(a, b)| (a - b).abs() < 1e-12));
    }

    #[test]
    fn test_source_count_mismatch() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let mut store = ParamStore::new();
        let node = FusionNode::new(1, 4, 1, 1, 3, 4, &mut store, &mut rng);
        let srcs = sources(&mut rng, 3);
        let refs: Vec<&Array3<f64>> = srcs.iter().collect();
        let (keep, ops) = weights(&mut rng, 3);
        assert!(node.forward(&refs, keep.view(), ops.view(), &store).is_err());
    }

    #[test]
    fn test_multi_step_gradients_match_finite_difference() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(10);
        let mut store = ParamStore::new();
        let node = FusionNode::new(0, 2, 3, 2, 3, 4, &mut store, &mut rng);
        let srcs = sources(&mut rng, 2);
        let (keep, ops) = weights(&mut rng, 2);
        let probe = Array3::from_shape_fn((2, 3, 4), |_| rng.gen::<f64>() - 0.5);

        let loss = |srcs: &[Array3<f64>], keep: &Array1<f64>, ops: &Array2<f64>| {
            let refs: Vec<&Array3<f64>> = srcs.iter().collect();
            (node.forward(&refs, keep.view(), ops.view(), &store).unwrap().0 * &probe).sum()
        };

        let refs: Vec<&Array3<f64>> = srcs.iter().collect();
        let (out, cache) = node.forward(&refs, keep.view(), ops.view(), &store).unwrap();
        assert_eq!(out.dim(), (2, 3, 4));
        let mut grads = store.zeros_like();
        let (d_src, d_keep, d_ops) = node.backward(&probe, keep.view(), ops.view(), &cache, &store, &mut grads);

        let eps = 1e-6;
        let mut plus = srcs.clone();
        plus[1][[1, 2, 3]] += eps;
        let mut minus = srcs.clone();
        minus[1][[1, 2, 3]] -= eps;
        let fd = (loss(&plus, &keep, &ops) - loss(&minus, &keep, &ops)) / (2.0 * eps);
        assert!((fd - d_src[1][[1, 2, 3]]).abs() < 1e-5);

        let mut kp = keep.clone();
        kp[0] += eps;
        let mut km = keep.clone();
        km[0] -= eps;
        let fd = (loss(&srcs, &kp, &ops) - loss(&srcs, &km, &ops)) / (2.0 * eps);
        assert!((fd - d_keep[0]).abs() < 1e-5);

        let mut op_plus = ops.clone();
        op_plus[[1, 3]] += eps;
        let mut op_minus = ops.clone();
        op_minus[[1, 3]] -= eps;
        let fd = (loss(&srcs, &keep, &op_plus) - loss(&srcs, &keep, &op_minus)) / (2.0 * eps);
        assert!((fd - d_ops[[1, 3]]).abs() < 1e-5);
    }
}
