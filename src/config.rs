//! Search configuration
//!
//! Hyperparameters consumed by the fusion graph and the bi-level searcher.
//! Field names serialize under the short keys used by experiment configs
//! (`C`, `L`, `Ti`, `Tm`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{FusionNasError, Result};

/// Averaging used for the validation F1 score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum F1Type {
    /// Per-class F1 weighted by class support
    Weighted,
    /// Unweighted mean of per-class F1
    Macro,
}

impl FromStr for F1Type {
    type Err = FusionNasError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "weighted" => Ok(Self::Weighted),
            "macro" => Ok(Self::Macro),
            other => Err(FusionNasError::config(format!(
                "f1_type must be 'weighted' or 'macro', got '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for F1Type {
    type Error = FusionNasError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<F1Type> for String {
    fn from(t: F1Type) -> String {
        t.to_string()
    }
}

impl fmt::Display for F1Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weighted => write!(f, "weighted"),
            Self::Macro => write!(f, "macro"),
        }
    }
}

/// Shape of the prediction target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Independent sigmoid per output, binary cross-entropy, threshold 0.5
    MultiLabel,
    /// Softmax over outputs, cross-entropy, argmax prediction
    MultiClass,
}

/// Order of the two gradient steps taken for each batch pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrder {
    WeightsThenArch,
    ArchThenWeights,
}

/// How the architecture gradient is approximated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchGradient {
    /// Gradient of the validation loss at the current network weights
    FirstOrder,
    /// Unrolled one-step lookahead with a finite-difference Hessian-vector product
    SecondOrder,
}

/// Configuration for a fusion architecture search run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of raw modality feature streams
    pub num_input_nodes: usize,
    /// Incoming edges retained per node when decoding
    pub num_keep_edges: usize,
    /// Internal nodes in the fusion cell
    pub steps: usize,
    /// Sub-steps inside each node
    pub node_steps: usize,
    /// Node outputs concatenated into the cell output
    pub multiplier: usize,
    /// Sub-step outputs concatenated into a node output
    pub node_multiplier: usize,
    /// Channel width of every representation
    #[serde(rename = "C")]
    pub channels: usize,
    /// Length of every representation
    #[serde(rename = "L")]
    pub length: usize,
    /// Number of output classes
    pub num_outputs: usize,
    /// Dropout rate in the classifier head
    pub drpt: f64,

    pub arch_learning_rate: f64,
    pub arch_weight_decay: f64,
    /// Adam betas for the architecture optimizer
    pub arch_betas: (f64, f64),
    /// Weight decay for network weights
    pub weight_decay: f64,

    pub eta_max: f64,
    pub eta_min: f64,
    /// Epochs in the first annealing cycle
    #[serde(rename = "Ti")]
    pub ti: usize,
    /// Cycle length multiplier after each restart
    #[serde(rename = "Tm")]
    pub tm: usize,

    pub epochs: usize,
    pub batchsize: usize,
    pub f1_type: F1Type,
    pub task: TaskKind,
    pub update_order: UpdateOrder,
    pub arch_gradient: ArchGradient,

    /// Shard each mini-batch across a thread pool
    pub parallel: bool,
    pub num_shards: usize,
    /// Largest batch tensor (elements over all modalities) accepted
    pub max_batch_elements: usize,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_input_nodes: 6,
            num_keep_edges: 2,
            steps: 2,
            node_steps: 1,
            multiplier: 2,
            node_multiplier: 1,
            channels: 192,
            length: 16,
            num_outputs: 23,
            drpt: 0.1,
            arch_learning_rate: 3e-4,
            arch_weight_decay: 1e-3,
            arch_betas: (0.5, 0.999),
            weight_decay: 1e-4,
            eta_max: 1e-3,
            eta_min: 1e-6,
            ti: 1,
            tm: 2,
            epochs: 30,
            batchsize: 8,
            f1_type: F1Type::Weighted,
            task: TaskKind::MultiLabel,
            update_order: UpdateOrder::WeightsThenArch,
            arch_gradient: ArchGradient::FirstOrder,
            parallel: false,
            num_shards: 1,
            max_batch_elements: 1 << 28,
            seed: 2,
        }
    }
}

impl SearchConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cell topology
    pub fn with_topology(mut self, num_input_nodes: usize, steps: usize, num_keep_edges: usize) -> Self {
        self.num_input_nodes = num_input_nodes;
        self.steps = steps;
        self.num_keep_edges = num_keep_edges;
        self.multiplier = self.multiplier.min(steps.max(1));
        self
    }

    /// Set the representation shape
    pub fn with_shape(mut self, channels: usize, length: usize) -> Self {
        self.channels = channels;
        self.length = length;
        self
    }

    /// Set node sub-steps and how many of them form the node output
    pub fn with_node_steps(mut self, node_steps: usize, node_multiplier: usize) -> Self {
        self.node_steps = node_steps;
        self.node_multiplier = node_multiplier;
        self
    }

    pub fn with_multiplier(mut self, multiplier: usize) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_outputs(mut self, num_outputs: usize, task: TaskKind) -> Self {
        self.num_outputs = num_outputs;
        self.task = task;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batchsize(mut self, batchsize: usize) -> Self {
        self.batchsize = batchsize;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_f1_type(mut self, f1_type: F1Type) -> Self {
        self.f1_type = f1_type;
        self
    }

    pub fn with_dropout(mut self, drpt: f64) -> Self {
        self.drpt = drpt;
        self
    }

    pub fn with_update_order(mut self, order: UpdateOrder) -> Self {
        self.update_order = order;
        self
    }

    pub fn with_arch_gradient(mut self, mode: ArchGradient) -> Self {
        self.arch_gradient = mode;
        self
    }

    /// Set the warm-restart cosine schedule
    pub fn with_schedule(mut self, eta_max: f64, eta_min: f64, ti: usize, tm: usize) -> Self {
        self.eta_max = eta_max;
        self.eta_min = eta_min;
        self.ti = ti;
        self.tm = tm;
        self
    }

    pub fn with_parallel(mut self, num_shards: usize) -> Self {
        self.parallel = num_shards > 1;
        self.num_shards = num_shards.max(1);
        self
    }

    /// Number of candidate sources feeding node `node`
    pub fn candidates_for_node(&self, node: usize) -> usize {
        self.num_input_nodes + node
    }

    /// Width of the cell output in channels
    pub fn cell_output_channels(&self) -> usize {
        self.multiplier * self.channels
    }

    /// Validate every constraint; called before a graph is built
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_input_nodes", self.num_input_nodes),
            ("num_keep_edges", self.num_keep_edges),
            ("steps", self.steps),
            ("node_steps", self.node_steps),
            ("multiplier", self.multiplier),
            ("node_multiplier", self.node_multiplier),
            ("C", self.channels),
            ("L", self.length),
            ("num_outputs", self.num_outputs),
            ("epochs", self.epochs),
            ("batchsize", self.batchsize),
            ("Ti", self.ti),
            ("Tm", self.tm),
            ("num_shards", self.num_shards),
            ("max_batch_elements", self.max_batch_elements),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(FusionNasError::config(format!("{} must be >= 1", name)));
            }
        }

        let max_candidates = self.num_input_nodes + self.steps - 1;
        if self.num_keep_edges > max_candidates {
            return Err(FusionNasError::config(format!(
                "num_keep_edges = {} exceeds the {} candidate sources available to the last node",
                self.num_keep_edges, max_candidates
            )));
        }
        if self.multiplier > self.steps {
            return Err(FusionNasError::config(format!(
                "multiplier = {} exceeds steps = {}",
                self.multiplier, self.steps
            )));
        }
        if self.node_multiplier > self.node_steps {
            return Err(FusionNasError::config(format!(
                "node_multiplier = {} exceeds node_steps = {}",
                self.node_multiplier, self.node_steps
            )));
        }
        if !(0.0..1.0).contains(&self.drpt) {
            return Err(FusionNasError::config(format!("drpt must be in [0, 1), got {}", self.drpt)));
        }
        if !(self.eta_min >= 0.0 && self.eta_min <= self.eta_max) || !self.eta_max.is_finite() {
            return Err(FusionNasError::config(format!(
                "learning rates must satisfy 0 <= eta_min <= eta_max, got eta_min = {}, eta_max = {}",
                self.eta_min, self.eta_max
            )));
        }
        let non_negative = [
            ("arch_learning_rate", self.arch_learning_rate),
            ("arch_weight_decay", self.arch_weight_decay),
            ("weight_decay", self.weight_decay),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(FusionNasError::config(format!("{} must be finite and >= 0, got {}", name, value)));
            }
        }
        let (b1, b2) = self.arch_betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            return Err(FusionNasError::config(format!("arch_betas must lie in [0, 1), got ({}, {})", b1, b2)));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FusionNasError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
