//! Multimodal fusion architecture search space
//!
//! Provides the differentiable fusion graph searched by the bi-level loop:
//! - Candidate edge operations and their mixture
//! - Fusion nodes with optional sub-steps
//! - The fusion cell DAG and its arena topology
//! - Architecture parameters kept apart from network weights
//! - Genotype decoding

pub mod ops;
pub mod params;
pub mod mixed_op;
pub mod node;
pub mod topology;
pub mod arch;
pub mod cell;
pub mod network;
pub mod genotype;

pub use ops::{EdgeOp, Operation, OpCache};
pub use params::{ParamId, ParamStore, ParameterGroup};
pub use mixed_op::{MixedCache, MixedOp};
pub use node::{FusionNode, NodeCache};
pub use topology::{EdgeRecord, FusionTopology, NodeRecord, SourceRef};
pub use arch::ArchitectureParameters;
pub use cell::{CellCache, FusionCell, NodeWeights};
pub use network::{Mode, SearchNetwork, StepGradients};
pub use genotype::{derive_genotype, Genotype, GenotypeEdge, NodeGenotype};
