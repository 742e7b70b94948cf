//! Kolosal Fusion NAS - Differentiable architecture search for multimodal fusion
//!
//! This crate searches how feature streams from several input modalities
//! should be combined before a classification head:
//! - A searchable fusion cell whose edges and operations are softmax-relaxed
//! - Bi-level optimization of network weights and architecture weights
//! - Decoding of the learned weights into a discrete genotype
//!
//! # Modules
//!
//! - [`nas`] - Search space: operations, nodes, fusion cell, genotype decoding
//! - [`train`] - Bi-level searcher, optimizers, schedule, metrics, data sources
//! - [`config`] - Search configuration
//! - [`context`] - Per-run random generator and device handle
//! - [`cli`] - Command-line interface
//!
//! # Example
//!
//! ```no_run
//! use kolosal_fusion_nas::prelude::*;
//!
//! let config = SearchConfig::default().with_shape(8, 4).with_epochs(2);
//! let mut ctx = RunContext::cpu(config.seed);
//! let data = InMemoryDataset::synthetic(&config, 64, ctx.rng())?;
//! let (train, valid) = data.split(0.8)?;
//!
//! let mut searcher = BilevelSearcher::with_tracing(config, Device::Cpu)?;
//! let (best_f1, genotype) = searcher.search(&train, &valid)?.into_parts();
//! println!("{:.4}\n{}", best_f1, genotype);
//! # Ok::<(), kolosal_fusion_nas::error::FusionNasError>(())
//! ```

// Core error handling
pub mod error;

pub mod config;
pub mod context;
pub mod tensor;

// Search space and search loop
pub mod nas;
pub mod train;

// Services
pub mod cli;

pub use error::{FusionNasError, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{ArchGradient, F1Type, SearchConfig, TaskKind, UpdateOrder};
    pub use crate::context::{Device, RunContext};
    pub use crate::error::{FusionNasError, Result};
    pub use crate::nas::{
        derive_genotype, ArchitectureParameters, EdgeOp, FusionTopology, Genotype, ParamStore,
        ParameterGroup, SearchNetwork,
    };
    pub use crate::train::{
        Batch, BatchSource, BilevelSearcher, InMemoryDataset, ProgressSink, RecordingProgress,
        SearchOutcome, SearchPhase, Targets, TracingProgress,
    };
}
