//! Batches and batch sources
//!
//! Loading and augmentation live outside the search core. The searcher only
//! needs indexed access to already-prepared mini-batches, expressed by the
//! [`BatchSource`] trait. [`InMemoryDataset`] is the stock implementation.

use ndarray::{s, Array2, Array3, Axis};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{SearchConfig, TaskKind};
use crate::error::{FusionNasError, Result};

/// Targets of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Targets {
    /// `[B, num_outputs]` matrix of 0/1 entries
    MultiHot(Array2<f64>),
    /// One class index per sample
    Labels(Vec<usize>),
}

impl Targets {
    pub fn len(&self) -> usize {
        match self {
            Targets::MultiHot(y) => y.nrows(),
            Targets::Labels(y) => y.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows `start..end`
    pub fn slice(&self, start: usize, end: usize) -> Targets {
        match self {
            Targets::MultiHot(y) => Targets::MultiHot(y.slice(s![start..end, ..]).to_owned()),
            Targets::Labels(y) => Targets::Labels(y[start..end].to_vec()),
        }
    }

    /// Rows picked by `indices`, in order
    pub fn select(&self, indices: &[usize]) -> Targets {
        match self {
            Targets::MultiHot(y) => Targets::MultiHot(y.select(Axis(0), indices)),
            Targets::Labels(y) => Targets::Labels(indices.iter().map(|&i| y[i]).collect()),
        }
    }

    /// Multi-hot view of the targets
    pub fn to_multi_hot(&self, num_outputs: usize) -> Array2<f64> {
        match self {
            Targets::MultiHot(y) => y.clone(),
            Targets::Labels(y) => {
                let mut out = Array2::zeros((y.len(), num_outputs));
                for (i, &label) in y.iter().enumerate() {
                    if label < num_outputs {
                        out[[i, label]] = 1.0;
                    }
                }
                out
            }
        }
    }
}

/// One mini-batch: a `[B, C, L]` tensor per modality plus targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub modalities: Vec<Array3<f64>>,
    pub targets: Targets,
}

impl Batch {
    pub fn new(modalities: Vec<Array3<f64>>, targets: Targets) -> Self {
        Self { modalities, targets }
    }

    pub fn batch_size(&self) -> usize {
        self.targets.len()
    }

    /// Elements over all modality tensors
    pub fn num_elements(&self) -> usize {
        self.modalities.iter().map(|m| m.len()).sum()
    }

    /// Check the batch against the configured modality layout and task
    pub fn validate(&self, config: &SearchConfig) -> Result<()> {
        if self.modalities.len() != config.num_input_nodes {
            return Err(FusionNasError::data(format!(
                "batch has {} modalities, expected {}",
                self.modalities.len(),
                config.num_input_nodes
            )));
        }
        let batch = self.batch_size();
        if batch == 0 {
            return Err(FusionNasError::data("batch is empty"));
        }
        for (m, x) in self.modalities.iter().enumerate() {
            let (b, c, l) = x.dim();
            if b != batch || c != config.channels || l != config.length {
                return Err(FusionNasError::data(format!(
                    "modality {} has shape [{}, {}, {}], expected [{}, {}, {}]",
                    m, b, c, l, batch, config.channels, config.length
                )));
            }
        }
        match (&self.targets, config.task) {
            (Targets::MultiHot(y), TaskKind::MultiLabel) => {
                if y.ncols() != config.num_outputs {
                    return Err(FusionNasError::data(format!(
                        "multi-hot targets have {} columns, expected {}",
                        y.ncols(),
                        config.num_outputs
                    )));
                }
            }
            (Targets::Labels(y), TaskKind::MultiClass) => {
                if let Some(&bad) = y.iter().find(|&&label| label >= config.num_outputs) {
                    return Err(FusionNasError::data(format!(
                        "label {} out of range for {} outputs",
                        bad, config.num_outputs
                    )));
                }
            }
            (_, task) => {
                return Err(FusionNasError::data(format!("targets do not match task {:?}", task)));
            }
        }
        Ok(())
    }

    /// Split into at most `n` contiguous shards of near-equal size
    pub fn split(&self, n: usize) -> Vec<Batch> {
        let batch = self.batch_size();
        let n = n.clamp(1, batch.max(1));
        let base = batch / n;
        let extra = batch % n;
        let mut shards = Vec::with_capacity(n);
        let mut start = 0;
        for i in 0..n {
            let end = start + base + usize::from(i < extra);
            if end > start {
                shards.push(Batch {
                    modalities: self
                        .modalities
                        .iter()
                        .map(|m| m.slice(s![start..end, .., ..]).to_owned())
                        .collect(),
                    targets: self.targets.slice(start, end),
                });
            }
            start = end;
        }
        shards
    }
}

/// Indexed access to prepared mini-batches
pub trait BatchSource: Send + Sync {
    fn num_batches(&self) -> usize;

    fn batch(&self, index: usize) -> Result<Batch>;
}

/// Full sample set held in memory and served in `batchsize` chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InMemoryDataset {
    modalities: Vec<Array3<f64>>,
    targets: Targets,
    batchsize: usize,
}

impl InMemoryDataset {
    pub fn new(modalities: Vec<Array3<f64>>, targets: Targets, batchsize: usize) -> Result<Self> {
        if batchsize == 0 {
            return Err(FusionNasError::config("batchsize must be >= 1"));
        }
        let n = targets.len();
        if let Some(m) = modalities.iter().position(|x| x.dim().0 != n) {
            return Err(FusionNasError::data(format!(
                "modality {} has {} samples, targets have {}",
                m,
                modalities[m].dim().0,
                n
            )));
        }
        Ok(Self {
            modalities,
            targets,
            batchsize,
        })
    }

    /// Learnable multimodal data: every modality carries a class-dependent offset
    pub fn synthetic(config: &SearchConfig, n_samples: usize, rng: &mut impl Rng) -> Result<Self> {
        let (c, l, k) = (config.channels, config.length, config.num_outputs);
        let prototypes: Vec<Array2<f64>> = (0..config.num_input_nodes)
            .map(|_| Array2::from_shape_fn((k, c), |_| rng.gen::<f64>() * 2.0 - 1.0))
            .collect();

        let targets = match config.task {
            TaskKind::MultiClass => Targets::Labels((0..n_samples).map(|_| rng.gen_range(0..k)).collect()),
            TaskKind::MultiLabel => {
                let mut y = Array2::from_shape_fn((n_samples, k), |_| if rng.gen::<f64>() < 0.3 { 1.0 } else { 0.0 });
                for mut row in y.rows_mut() {
                    if row.sum() == 0.0 {
                        row[rng.gen_range(0..k)] = 1.0;
                    }
                }
                Targets::MultiHot(y)
            }
        };
        let hot = targets.to_multi_hot(k);

        let modalities = prototypes
            .iter()
            .map(|proto| {
                let signal = hot.dot(proto);
                Array3::from_shape_fn((n_samples, c, l), |(i, ch, _)| signal[[i, ch]] + 0.3 * (rng.gen::<f64>() - 0.5))
            })
            .collect();
        Self::new(modalities, targets, config.batchsize)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn batchsize(&self) -> usize {
        self.batchsize
    }

    /// Same samples served in chunks of `batchsize`
    pub fn with_batchsize(mut self, batchsize: usize) -> Result<Self> {
        if batchsize == 0 {
            return Err(FusionNasError::config("batchsize must be >= 1"));
        }
        self.batchsize = batchsize;
        Ok(self)
    }

    /// Permute samples in place
    pub fn shuffle(&mut self, rng: &mut impl Rng) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.modalities = self.modalities.iter().map(|m| m.select(Axis(0), &order)).collect();
        self.targets = self.targets.select(&order);
    }

    /// First `fraction` of samples and the remainder
    pub fn split(&self, fraction: f64) -> Result<(Self, Self)> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(FusionNasError::config(format!("split fraction must be in [0, 1], got {}", fraction)));
        }
        let cut = (self.len() as f64 * fraction).round() as usize;
        let head: Vec<usize> = (0..cut).collect();
        let tail: Vec<usize> = (cut..self.len()).collect();
        let take = |idx: &[usize]| Self {
            modalities: self.modalities.iter().map(|m| m.select(Axis(0), idx)).collect(),
            targets: self.targets.select(idx),
            batchsize: self.batchsize,
        };
        Ok((take(&head), take(&tail)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let dataset: Self = serde_json::from_str(&json)?;
        Self::new(dataset.modalities, dataset.targets, dataset.batchsize)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

impl BatchSource for InMemoryDataset {
    fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batchsize)
    }

    fn batch(&self, index: usize) -> Result<Batch> {
        let start = index * self.batchsize;
        if start >= self.len() {
            return Err(FusionNasError::data(format!(
                "batch {} out of range ({} batches)",
                index,
                self.num_batches()
            )));
        }
        let end = (start + self.batchsize).min(self.len());
        Ok(Batch {
            modalities: self
                .modalities
                .iter()
                .map(|m| m.slice(s![start..end, .., ..]).to_owned())
                .collect(),
            targets: self.targets.slice(start, end),
        })
    }
}
