//! Bi-level architecture searcher
//!
//! Alternates network-weight steps on training batches with architecture
//! steps on validation batches, evaluates validation F1 after every epoch and
//! decodes the genotype of the best-scoring architecture snapshot.
//!
//! The two parameter groups have separate optimizers and are only ever
//! written by their own step, so a forward pass never observes a half-updated
//! group.

use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::data::{Batch, BatchSource};
use super::metrics::f1_score;
use super::optim::Adam;
use super::progress::{ProgressSink, TracingProgress};
use super::scheduler::CosineAnnealingWarmRestarts;
use crate::config::{ArchGradient, SearchConfig, UpdateOrder};
use crate::context::{Device, RunContext};
use crate::error::{FusionNasError, Result};
use crate::nas::arch::ArchitectureParameters;
use crate::nas::genotype::{derive_genotype, Genotype};
use crate::nas::network::{Mode, SearchNetwork, StepGradients};
use crate::nas::params::{ParamStore, ParameterGroup};
use crate::tensor::all_finite;

/// Lifecycle state of a search run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchPhase {
    Initializing,
    TrainWeightsEpoch,
    TrainArchEpoch,
    Evaluating,
    Decoding,
    Done,
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-epoch summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Network learning rate at the start of the epoch
    pub lr: f64,
    pub train_loss: f64,
    pub arch_loss: f64,
    pub val_f1: f64,
}

/// Result of a completed search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub best_f1: f64,
    pub best_genotype: Genotype,
    pub best_epoch: usize,
    /// Architecture parameters of the best epoch
    pub best_arch: ArchitectureParameters,
    pub history: Vec<EpochRecord>,
}

impl SearchOutcome {
    /// `(best validation metric, best genotype)`
    pub fn into_parts(self) -> (f64, Genotype) {
        (self.best_f1, self.best_genotype)
    }
}

/// Alternating weight/architecture optimizer over a [`SearchNetwork`]
pub struct BilevelSearcher<S: ProgressSink = TracingProgress> {
    config: SearchConfig,
    ctx: RunContext,
    network: SearchNetwork,
    params: ParamStore,
    arch: ArchitectureParameters,
    weight_optim: Adam,
    arch_optim: Adam,
    scheduler: CosineAnnealingWarmRestarts,
    sink: S,
    phase: SearchPhase,
    epoch: usize,
    batch: usize,
}

impl BilevelSearcher<TracingProgress> {
    /// Searcher reporting through `tracing`
    pub fn with_tracing(config: SearchConfig, device: Device) -> Result<Self> {
        Self::new(config, device, TracingProgress)
    }
}

impl<S: ProgressSink> BilevelSearcher<S> {
    /// Validate the configuration and build the graph; seeds come from `config.seed`
    pub fn new(config: SearchConfig, device: Device, sink: S) -> Result<Self> {
        let ctx = RunContext::new(config.seed, device);
        Self::with_context(config, ctx, sink)
    }

    pub fn with_context(config: SearchConfig, mut ctx: RunContext, sink: S) -> Result<Self> {
        config.validate()?;
        let (network, params) = SearchNetwork::new(&config, &mut ctx)?;
        let arch = network.init_arch(&mut ctx);
        let weight_optim = Adam::for_weights(&params, config.weight_decay);
        let arch_optim = Adam::new(&arch, config.arch_betas, config.arch_weight_decay);
        let scheduler = CosineAnnealingWarmRestarts::from_config(&config);
        debug!(
            device = %ctx.device(),
            weights = params.num_elements(),
            arch = arch.num_elements(),
            "Search network built"
        );
        Ok(Self {
            config,
            ctx,
            network,
            params,
            arch,
            weight_optim,
            arch_optim,
            scheduler,
            sink,
            phase: SearchPhase::Initializing,
            epoch: 0,
            batch: 0,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn network(&self) -> &SearchNetwork {
        &self.network
    }

    /// Current architecture parameters
    pub fn arch(&self) -> &ArchitectureParameters {
        &self.arch
    }

    /// Current network weights
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Genotype decoded from the current architecture parameters
    pub fn genotype(&self) -> Result<Genotype> {
        derive_genotype(self.network.topology(), &self.arch, self.config.num_keep_edges)
    }

    fn divergence(&self, detail: impl Into<String>) -> FusionNasError {
        FusionNasError::NumericDivergence {
            epoch: self.epoch,
            phase: self.phase,
            batch: self.batch,
            detail: detail.into(),
        }
    }

    fn check_resources(&self, batch: &Batch) -> Result<()> {
        let elements = batch.num_elements();
        if elements > self.config.max_batch_elements {
            return Err(FusionNasError::ResourceExhaustion {
                epoch: self.epoch,
                phase: self.phase,
                batch: self.batch,
                detail: format!(
                    "batch holds {} elements, limit is {}",
                    elements, self.config.max_batch_elements
                ),
            });
        }
        Ok(())
    }

    fn check_finite(&self, grads: &StepGradients) -> Result<()> {
        if !grads.loss.is_finite() {
            return Err(self.divergence(format!("loss is {}", grads.loss)));
        }
        if !grads.net.is_finite() {
            return Err(self.divergence("non-finite network weight gradient"));
        }
        if !grads.arch.is_finite() {
            return Err(self.divergence("non-finite architecture gradient"));
        }
        Ok(())
    }

    /// One dropout seed per shard
    fn draw_seeds(&mut self) -> Vec<u64> {
        let shards = if self.config.parallel { self.config.num_shards } else { 1 };
        (0..shards).map(|_| self.ctx.fork_seed()).collect()
    }

    fn gradients(
        &self,
        batch: &Batch,
        arch: &ArchitectureParameters,
        params: &ParamStore,
        seeds: &[u64],
    ) -> Result<StepGradients> {
        let grads = if self.config.parallel && self.config.num_shards > 1 {
            self.network
                .loss_and_grads_sharded(batch, arch, params, Some(seeds), self.config.num_shards)?
        } else {
            let mode = match seeds.first() {
                Some(&seed) => Mode::Train { seed },
                None => Mode::Eval,
            };
            self.network.loss_and_grads(batch, arch, params, mode)?
        };
        self.check_finite(&grads)?;
        Ok(grads)
    }

    /// Network-weight step on a training batch; architecture parameters stay fixed
    pub fn train_weights_step(&mut self, batch: &Batch, lr: f64) -> Result<f64> {
        self.phase = SearchPhase::TrainWeightsEpoch;
        self.check_resources(batch)?;
        let seeds = self.draw_seeds();
        let grads = self.gradients(batch, &self.arch, &self.params, &seeds)?;
        self.weight_optim.step(&mut self.params, &grads.net, lr);
        if !self.params.is_finite() {
            return Err(self.divergence("network weights became non-finite"));
        }
        Ok(grads.loss)
    }

    /// Architecture gradient on a validation batch, not applied
    ///
    /// `lr` is the network learning rate used for the unrolled lookahead in
    /// second-order mode. Returns the validation loss and the gradient.
    pub fn arch_gradient(
        &mut self,
        train_batch: &Batch,
        valid_batch: &Batch,
        lr: f64,
    ) -> Result<(f64, ArchitectureParameters)> {
        let seeds = self.draw_seeds();
        match self.config.arch_gradient {
            ArchGradient::FirstOrder => {
                let grads = self.gradients(valid_batch, &self.arch, &self.params, &seeds)?;
                Ok((grads.loss, grads.arch))
            }
            ArchGradient::SecondOrder => self.unrolled_arch_gradient(train_batch, valid_batch, lr, &seeds),
        }
    }

    /// dα L_val(w', α) with w' = w − ξ(∇w L_train(w, α) + λw), where the
    /// implicit term uses a central difference at w ± ε·∇w' L_val
    fn unrolled_arch_gradient(
        &self,
        train_batch: &Batch,
        valid_batch: &Batch,
        xi: f64,
        seeds: &[u64],
    ) -> Result<(f64, ArchitectureParameters)> {
        let train = self.gradients(train_batch, &self.arch, &self.params, seeds)?;
        let mut unrolled = self.params.clone();
        unrolled.add_scaled(&train.net, -xi);
        unrolled.add_scaled(&self.params, -xi * self.config.weight_decay);

        let valid = self.gradients(valid_batch, &self.arch, &unrolled, seeds)?;
        let norm = valid.net.sq_norm().sqrt();
        if norm == 0.0 {
            return Ok((valid.loss, valid.arch));
        }
        let eps = 0.01 / norm;

        let mut plus = self.params.clone();
        plus.add_scaled(&valid.net, eps);
        let mut minus = self.params.clone();
        minus.add_scaled(&valid.net, -eps);
        let d_plus = self.gradients(train_batch, &self.arch, &plus, seeds)?.arch;
        let d_minus = self.gradients(train_batch, &self.arch, &minus, seeds)?.arch;

        let mut d_arch = valid.arch;
        d_arch.add_scaled(&d_plus, -xi / (2.0 * eps));
        d_arch.add_scaled(&d_minus, xi / (2.0 * eps));
        Ok((valid.loss, d_arch))
    }

    /// Architecture step; network weights stay fixed
    pub fn train_arch_step(&mut self, train_batch: &Batch, valid_batch: &Batch, lr: f64) -> Result<f64> {
        self.phase = SearchPhase::TrainArchEpoch;
        self.check_resources(valid_batch)?;
        let (loss, d_arch) = self.arch_gradient(train_batch, valid_batch, lr)?;
        if !d_arch.is_finite() {
            return Err(self.divergence("non-finite architecture gradient"));
        }
        self.arch_optim.step(&mut self.arch, &d_arch, self.config.arch_learning_rate);
        if !self.arch.is_finite() {
            return Err(self.divergence("architecture parameters became non-finite"));
        }
        Ok(loss)
    }

    /// Validation F1 of the current weights and architecture
    pub fn evaluate(&mut self, valid: &dyn BatchSource) -> Result<f64> {
        self.phase = SearchPhase::Evaluating;
        let mut preds = Vec::with_capacity(valid.num_batches());
        let mut truth = Vec::with_capacity(valid.num_batches());
        for i in 0..valid.num_batches() {
            self.batch = i;
            let batch = valid.batch(i)?;
            self.check_resources(&batch)?;
            let logits = self.network.forward(&batch.modalities, &self.arch, &self.params, Mode::Eval)?;
            if !all_finite(logits.iter()) {
                return Err(self.divergence("non-finite validation logits"));
            }
            preds.push(self.network.decide(&logits));
            truth.push(batch.targets.to_multi_hot(self.config.num_outputs));
        }
        let stack = |parts: &[Array2<f64>]| -> Result<Array2<f64>> {
            let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
            Ok(concatenate(Axis(0), &views)?)
        };
        Ok(f1_score(&stack(&truth)?, &stack(&preds)?, self.config.f1_type))
    }

    /// Every batch of both splits must match the configured layout
    fn validate_sources(&self, train: &dyn BatchSource, valid: &dyn BatchSource) -> Result<()> {
        for (name, source) in [("training", train), ("validation", valid)] {
            if source.num_batches() == 0 {
                return Err(FusionNasError::data(format!("{} split has no batches", name)));
            }
            for i in 0..source.num_batches() {
                source.batch(i)?.validate(&self.config).map_err(|e| match e {
                    FusionNasError::DataContract(detail) => {
                        FusionNasError::data(format!("{} batch {}: {}", name, i, detail))
                    }
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    /// Run the full search
    ///
    /// Validation batches are cycled when the validation split has fewer
    /// batches than the training split.
    pub fn search(&mut self, train: &dyn BatchSource, valid: &dyn BatchSource) -> Result<SearchOutcome> {
        self.phase = SearchPhase::Initializing;
        self.validate_sources(train, valid)?;

        let n_train = train.num_batches();
        let n_valid = valid.num_batches();
        self.sink.search_started(self.config.epochs, n_train, n_valid);

        let mut best: Option<(f64, usize, ArchitectureParameters)> = None;
        let mut history = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            self.epoch = epoch;
            let epoch_lr = self.scheduler.lr_at(epoch as f64);
            self.sink.epoch_started(epoch, epoch_lr);

            let mut train_loss = 0.0;
            let mut arch_loss = 0.0;
            for i in 0..n_train {
                self.batch = i;
                let lr = self.scheduler.lr_at(epoch as f64 + i as f64 / n_train as f64);
                let train_batch = train.batch(i)?;
                let valid_batch = valid.batch(i % n_valid)?;
                match self.config.update_order {
                    UpdateOrder::WeightsThenArch => {
                        train_loss += self.train_weights_step(&train_batch, lr)?;
                        arch_loss += self.train_arch_step(&train_batch, &valid_batch, lr)?;
                    }
                    UpdateOrder::ArchThenWeights => {
                        arch_loss += self.train_arch_step(&train_batch, &valid_batch, lr)?;
                        train_loss += self.train_weights_step(&train_batch, lr)?;
                    }
                }
                debug!(epoch, batch = i, lr, "Batch pair done");
            }
            train_loss /= n_train as f64;
            arch_loss /= n_train as f64;
            self.sink.phase_finished(epoch, SearchPhase::TrainWeightsEpoch, train_loss);
            self.sink.phase_finished(epoch, SearchPhase::TrainArchEpoch, arch_loss);

            let f1 = self.evaluate(valid)?;
            let improved = best.as_ref().map_or(true, |(b, _, _)| f1 > *b);
            if improved {
                best = Some((f1, epoch, self.arch.snapshot()));
            }
            self.sink.epoch_evaluated(epoch, f1, improved);
            let genotype = self.genotype()?;
            self.sink.genotype(epoch, &genotype);

            history.push(EpochRecord {
                epoch,
                lr: epoch_lr,
                train_loss,
                arch_loss,
                val_f1: f1,
            });
        }

        self.phase = SearchPhase::Decoding;
        let (best_f1, best_epoch, best_arch) =
            best.ok_or_else(|| FusionNasError::config("search ran for zero epochs"))?;
        let best_genotype = derive_genotype(self.network.topology(), &best_arch, self.config.num_keep_edges)?;

        self.phase = SearchPhase::Done;
        self.sink.search_finished(best_f1, best_epoch);
        Ok(SearchOutcome {
            best_f1,
            best_genotype,
            best_epoch,
            best_arch,
            history,
        })
    }
}
