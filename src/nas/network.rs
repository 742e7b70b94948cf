//! Searchable network: fusion cell, classifier head and loss
//!
//! The network holds structure only. Weights are passed in as a
//! [`ParamStore`] and architecture logits as [`ArchitectureParameters`], so a
//! forward/backward pass never mutates shared state and can run on several
//! batch shards at once.

use ndarray::{Array2, Array3, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use super::arch::ArchitectureParameters;
use super::cell::FusionCell;
use super::ops::EdgeOp;
use super::params::{ParamId, ParamStore, ParameterGroup};
use super::topology::FusionTopology;
use crate::config::{SearchConfig, TaskKind};
use crate::context::RunContext;
use crate::error::{FusionNasError, Result};
use crate::tensor::{sigmoid, softmax};
use crate::train::data::{Batch, Targets};

/// Dropout behaviour for one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dropout active, mask drawn from a generator seeded with this value
    Train { seed: u64 },
    Eval,
}

/// Loss and gradients of one batch
#[derive(Debug, Clone)]
pub struct StepGradients {
    pub loss: f64,
    pub net: ParamStore,
    pub arch: ArchitectureParameters,
}

#[derive(Debug, Clone)]
struct ClassifierHead {
    w: ParamId,
    b: ParamId,
}

#[derive(Debug, Clone)]
pub struct SearchNetwork {
    cell: FusionCell,
    head: ClassifierHead,
    task: TaskKind,
    num_outputs: usize,
    drpt: f64,
}

/// Flatten `[B, C, L]` to `[B, C * L]`
fn flatten(x: &Array3<f64>) -> Array2<f64> {
    let (b, c, l) = x.dim();
    Array2::from_shape_fn((b, c * l), |(i, j)| x[[i, j / l, j % l]])
}

fn unflatten(x: &Array2<f64>, channels: usize, length: usize) -> Array3<f64> {
    Array3::from_shape_fn((x.nrows(), channels, length), |(i, c, l)| x[[i, c * length + l]])
}

impl SearchNetwork {
    /// Validate the configuration, build the graph and initialize weights
    pub fn new(config: &SearchConfig, ctx: &mut RunContext) -> Result<(Self, ParamStore)> {
        config.validate()?;
        let mut store = ParamStore::new();
        let cell = FusionCell::new(config, &mut store, ctx.rng())?;
        let features = cell.output_channels() * config.length;
        let head = ClassifierHead {
            w: store.register_glorot("head.w", features, config.num_outputs, ctx.rng()),
            b: store.register_bias("head.b", config.num_outputs),
        };
        let network = Self {
            cell,
            head,
            task: config.task,
            num_outputs: config.num_outputs,
            drpt: config.drpt,
        };
        Ok((network, store))
    }

    pub fn topology(&self) -> &FusionTopology {
        self.cell.topology()
    }

    pub fn cell(&self) -> &FusionCell {
        &self.cell
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn num_ops(&self) -> usize {
        EdgeOp::count()
    }

    /// Fresh architecture logits for this graph
    pub fn init_arch(&self, ctx: &mut RunContext) -> ArchitectureParameters {
        ArchitectureParameters::random(self.topology(), self.num_ops(), ctx.rng())
    }

    fn dropout_mask(&self, shape: (usize, usize), mode: Mode) -> Option<Array2<f64>> {
        match mode {
            Mode::Train { seed } if self.drpt > 0.0 => {
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                let keep = 1.0 - self.drpt;
                Some(Array2::from_shape_fn(shape, |_| {
                    if rng.gen::<f64>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                }))
            }
            _ => None,
        }
    }

    /// Logits for a set of modality inputs
    pub fn forward(
        &self,
        inputs: &[Array3<f64>],
        arch: &ArchitectureParameters,
        store: &ParamStore,
        mode: Mode,
    ) -> Result<Array2<f64>> {
        let (fused, _) = self.cell.forward(inputs, arch, store)?;
        let mut flat = flatten(&fused);
        if let Some(mask) = self.dropout_mask(flat.dim(), mode) {
            flat *= &mask;
        }
        Ok(flat.dot(store.get(self.head.w)) + store.get(self.head.b))
    }

    /// Multi-hot predictions (`[B, num_outputs]`)
    pub fn predict(
        &self,
        inputs: &[Array3<f64>],
        arch: &ArchitectureParameters,
        store: &ParamStore,
    ) -> Result<Array2<f64>> {
        let logits = self.forward(inputs, arch, store, Mode::Eval)?;
        Ok(self.decide(&logits))
    }

    /// Threshold (multi-label) or argmax (multi-class) logits into multi-hot rows
    pub fn decide(&self, logits: &Array2<f64>) -> Array2<f64> {
        match self.task {
            TaskKind::MultiLabel => logits.mapv(|z| if sigmoid(z) > 0.5 { 1.0 } else { 0.0 }),
            TaskKind::MultiClass => {
                let mut pred = Array2::zeros(logits.raw_dim());
                for (i, row) in logits.axis_iter(Axis(0)).enumerate() {
                    let mut best = 0;
                    for (k, &v) in row.iter().enumerate() {
                        if v > row[best] {
                            best = k;
                        }
                    }
                    pred[[i, best]] = 1.0;
                }
                pred
            }
        }
    }

    /// Mean loss and its gradient w.r.t. the logits
    fn loss_and_grad(&self, logits: &Array2<f64>, targets: &Targets) -> Result<(f64, Array2<f64>)> {
        let (batch, k) = logits.dim();
        match (self.task, targets) {
            (TaskKind::MultiLabel, Targets::MultiHot(y)) => {
                let n = (batch * k) as f64;
                let mut loss = 0.0;
                let mut grad = Array2::zeros(logits.raw_dim());
                ndarray::Zip::from(&mut grad).and(logits).and(y).for_each(|g, &z, &t| {
                    loss += z.max(0.0) - z * t + (-z.abs()).exp().ln_1p();
                    *g = (sigmoid(z) - t) / n;
                });
                Ok((loss / n, grad))
            }
            (TaskKind::MultiClass, Targets::Labels(labels)) => {
                let n = batch as f64;
                let mut loss = 0.0;
                let mut grad = Array2::zeros(logits.raw_dim());
                for (i, &label) in labels.iter().enumerate() {
                    if label >= k {
                        return Err(FusionNasError::data(format!("label {} out of range for {} outputs", label, k)));
                    }
                    let p = softmax(logits.row(i));
                    loss -= p[label].max(f64::MIN_POSITIVE).ln();
                    let mut row = grad.row_mut(i);
                    row.assign(&(p / n));
                    row[label] -= 1.0 / n;
                }
                Ok((loss / n, grad))
            }
            (task, _) => Err(FusionNasError::data(format!(
                "targets do not match task {:?}",
                task
            ))),
        }
    }

    /// Loss plus gradients for both parameter groups on one batch
    pub fn loss_and_grads(
        &self,
        batch: &Batch,
        arch: &ArchitectureParameters,
        store: &ParamStore,
        mode: Mode,
    ) -> Result<StepGradients> {
        let (fused, cache) = self.cell.forward(&batch.modalities, arch, store)?;
        let (_, fused_channels, length) = fused.dim();
        let flat = flatten(&fused);
        let mask = self.dropout_mask(flat.dim(), mode);
        let dropped = match &mask {
            Some(m) => &flat * m,
            None => flat,
        };
        let logits = dropped.dot(store.get(self.head.w)) + store.get(self.head.b);
        let (loss, d_logits) = self.loss_and_grad(&logits, &batch.targets)?;

        let mut grads = store.zeros_like();
        grads.accumulate(self.head.w, &dropped.t().dot(&d_logits));
        grads.accumulate(self.head.b, &d_logits.sum_axis(Axis(0)).insert_axis(Axis(0)));
        let mut d_flat = d_logits.dot(&store.get(self.head.w).t());
        if let Some(m) = &mask {
            d_flat *= m;
        }
        let d_fused = unflatten(&d_flat, fused_channels, length);
        let (_, d_arch) = self.cell.backward(&d_fused, &cache, arch, store, &mut grads);

        Ok(StepGradients {
            loss,
            net: grads,
            arch: d_arch,
        })
    }

    /// [`Self::loss_and_grads`] over batch shards in parallel; one dropout seed per shard
    ///
    /// Seeds are reused cyclically when there are fewer seeds than shards.
    /// `None` or an empty slice evaluates every shard in [`Mode::Eval`].
    pub fn loss_and_grads_sharded(
        &self,
        batch: &Batch,
        arch: &ArchitectureParameters,
        store: &ParamStore,
        seeds: Option<&[u64]>,
        num_shards: usize,
    ) -> Result<StepGradients> {
        let shards = batch.split(num_shards);
        let total = batch.batch_size() as f64;
        let results: Vec<(f64, StepGradients)> = shards
            .par_iter()
            .enumerate()
            .map(|(i, shard)| {
                let mode = match seeds {
                    Some(s) if !s.is_empty() => Mode::Train { seed: s[i % s.len()] },
                    _ => Mode::Eval,
                };
                let share = shard.batch_size() as f64 / total;
                self.loss_and_grads(shard, arch, store, mode).map(|g| (share, g))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut loss = 0.0;
        let mut net = store.zeros_like();
        let mut d_arch = arch.zeros_like();
        for (share, g) in &results {
            loss += share * g.loss;
            net.add_scaled(&g.net, *share);
            d_arch.add_scaled(&g.arch, *share);
        }
        Ok(StepGradients { loss, net, arch: d_arch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskKind;

    fn config(task: TaskKind) -> SearchConfig {
        SearchConfig::default()
            .with_topology(2, 2, 2)
            .with_multiplier(2)
            .with_shape(3, 4)
            .with_outputs(3, task)
            .with_dropout(0.0)
    }

    fn batch(rng: &mut RunContext, task: TaskKind, size: usize) -> Batch {
        let modalities = (0..2)
            .map(|_| Array3::from_shape_fn((size, 3, 4), |_| rng.rng().gen::<f64>() - 0.5))
            .collect();
        let targets = match task {
            TaskKind::MultiLabel => Targets::MultiHot(Array2::from_shape_fn((size, 3), |(i, k)| ((i + k) % 2) as f64)),
            TaskKind::MultiClass => Targets::Labels((0..size).map(|i| i % 3).collect()),
        };
        Batch::new(modalities, targets)
    }

    #[test]
    fn test_forward_logit_shape() {
        let mut ctx = RunContext::cpu(1);
        let cfg = config(TaskKind::MultiLabel);
        let (net, store) = SearchNetwork::new(&cfg, &mut ctx).unwrap();
        let arch = net.init_arch(&mut ctx);
        let b = batch(&mut ctx, TaskKind::MultiLabel, 5);
        let logits = net.forward(&b.modalities, &arch, &store, Mode::Eval).unwrap();
        assert_eq!(logits.dim(), (5, 3));
        let pred = net.predict(&b.modalities, &arch, &store).unwrap();
        assert!(pred.iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn test_head_gradient_matches_finite_difference() {
        for task in [TaskKind::MultiLabel, TaskKind::MultiClass] {
            let mut ctx = RunContext::cpu(2);
            let cfg = config(task);
            let (net, store) = SearchNetwork::new(&cfg, &mut ctx).unwrap();
            let arch = net.init_arch(&mut ctx);
            let b = batch(&mut ctx, task, 4);
            let grads = net.loss_and_grads(&b, &arch, &store, Mode::Eval).unwrap();
            assert!(grads.loss.is_finite());

            let eps = 1e-6;
            for id in store.ids().filter(|&id| store.name(id).starts_with("head") || store.name(id).contains("pointwise.w")) {
                let mut plus = store.clone();
                plus.get_mut(id)[[0, 0]] += eps;
                let mut minus = store.clone();
                minus.get_mut(id)[[0, 0]] -= eps;
                let lp = net.loss_and_grads(&b, &arch, &plus, Mode::Eval).unwrap().loss;
                let lm = net.loss_and_grads(&b, &arch, &minus, Mode::Eval).unwrap().loss;
                let fd = (lp - lm) / (2.0 * eps);
                let analytic = grads.net.get(id)[[0, 0]];
                assert!((fd - analytic).abs() < 1e-5, "{:?} {}: {} vs {}", task, store.name(id), analytic, fd);
            }
        }
    }

    #[test]
    fn test_target_kind_must_match_task() {
        let mut ctx = RunContext::cpu(3);
        let (net, store) = SearchNetwork::new(&config(TaskKind::MultiLabel), &mut ctx).unwrap();
        let arch = net.init_arch(&mut ctx);
        let b = batch(&mut ctx, TaskKind::MultiClass, 4);
        let err = net.loss_and_grads(&b, &arch, &store, Mode::Eval).unwrap_err();
        assert!(matches!(err, FusionNasError::DataContract(_)));
    }

    #[test]
    fn test_sharded_gradients_equal_full_batch() {
        let mut ctx = RunContext::cpu(4);
        let (net, store) = SearchNetwork::new(&config(TaskKind::MultiClass), &mut ctx).unwrap();
        let arch = net.init_arch(&mut ctx);
        let b = batch(&mut ctx, TaskKind::MultiClass, 6);
        let full = net.loss_and_grads(&b, &arch, &store, Mode::Eval).unwrap();
        let sharded = net.loss_and_grads_sharded(&b, &arch, &store, None, 3).unwrap();
        assert!((full.loss - sharded.loss).abs() < 1e-10);
        assert!(full.net.max_abs_diff(&sharded.net) < 1e-10);
        assert!(full.arch.max_abs_diff(&sharded.arch) < 1e-10);
    }

    #[test]
    fn test_empty_seed_slice_runs_in_eval_mode() {
        let mut ctx = RunContext::cpu(6);
        let cfg = config(TaskKind::MultiLabel).with_dropout(0.5);
        let (net, store) = SearchNetwork::new(&cfg, &mut ctx).unwrap();
        let arch = net.init_arch(&mut ctx);
        let b = batch(&mut ctx, TaskKind::MultiLabel, 4);
        let empty = net.loss_and_grads_sharded(&b, &arch, &store, Some(&[]), 2).unwrap();
        let eval = net.loss_and_grads_sharded(&b, &arch, &store, None, 2).unwrap();
        assert_eq!(empty.loss, eval.loss);
        assert_eq!(empty.net, eval.net);
    }

    #[test]
    fn test_dropout_only_in_train_mode() {
        let mut ctx = RunContext::cpu(5);
        let cfg = config(TaskKind::MultiLabel).with_dropout(0.5);
        let (net, store) = SearchNetwork::new(&cfg, &mut ctx).unwrap();
        let arch = net.init_arch(&mut ctx);
        let b = batch(&mut ctx, TaskKind::MultiLabel, 4);
        let eval_a = net.forward(&b.modalities, &arch, &store, Mode::Eval).unwrap();
        let eval_b = net.forward(&b.modalities, &arch, &store, Mode::Eval).unwrap();
        assert_eq!(eval_a, eval_b);
        let train_a = net.forward(&b.modalities, &arch, &store, Mode::Train { seed: 1 }).unwrap();
        let train_b = net.forward(&b.modalities, &arch, &store, Mode::Train { seed: 1 }).unwrap();
        assert_eq!(train_a, train_b);
        assert_ne!(train_a, eval_a);
    }
}
