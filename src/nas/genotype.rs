//! Genotype: the discrete fusion graph decoded from architecture weights
//!
//! Decoding is a pure function of the architecture parameters. For every
//! node independently, candidate sources are ranked by normalized keep
//! weight and the top `num_keep_edges` are retained; each retained edge takes
//! its highest-weighted operation. Ties go to the lowest index.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::arch::ArchitectureParameters;
use super::ops::EdgeOp;
use super::topology::{FusionTopology, SourceRef};
use crate::error::{FusionNasError, Result};

/// A retained edge and its chosen operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenotypeEdge {
    pub source: SourceRef,
    pub op: EdgeOp,
}

/// Retained incoming edges of one node, strongest first
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeGenotype {
    pub node: usize,
    pub edges: Vec<GenotypeEdge>,
}

/// Discrete fusion graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Genotype {
    pub nodes: Vec<NodeGenotype>,
    /// Nodes whose outputs are concatenated into the fused representation
    pub concat: Vec<usize>,
}

impl Genotype {
    pub fn num_edges(&self) -> usize {
        self.nodes.iter().map(|n| n.edges.len()).sum()
    }

    /// Retained edges whose operation is not [`EdgeOp::Zero`]
    pub fn num_live_edges(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.edges.iter())
            .filter(|e| e.op != EdgeOp::Zero)
            .count()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Genotype(")?;
        for node in &self.nodes {
            let edges: Vec<String> = node
                .edges
                .iter()
                .map(|e| format!("{} <- {}", e.op, e.source))
                .collect();
            writeln!(f, "  node {}: [{}]", node.node, edges.join(", "))?;
        }
        write!(f, "  concat = {:?}\n)", self.concat)
    }
}

/// Index of the largest value; the lowest index wins ties
fn argmax(values: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v.total_cmp(&values[best]).is_gt() {
            best = i;
        }
    }
    best
}

/// Candidate positions ordered by descending weight, ascending index on ties
fn rank_descending(values: ArrayView1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order
}

/// Decode a genotype from the architecture parameters
///
/// [`EdgeOp::Zero`] competes in the per-edge argmax like every other
/// candidate, so a retained edge can decode to `zero`. With untrained
/// (uniform) op logits the lowest index wins and every edge decodes to
/// `zero`, giving a graph whose fused output is constant. Use
/// [`Genotype::num_live_edges`] to detect that case.
pub fn derive_genotype(
    topology: &FusionTopology,
    arch: &ArchitectureParameters,
    num_keep_edges: usize,
) -> Result<Genotype> {
    if num_keep_edges == 0 {
        return Err(FusionNasError::config("num_keep_edges must be >= 1"));
    }
    arch.check_layout(topology, arch.num_ops())?;

    let mut nodes = Vec::with_capacity(topology.num_nodes());
    for record in topology.nodes() {
        let keep = arch.keep_weights(record.id);
        let edges_in = topology.edges_into(record.id);
        let edges = rank_descending(keep.view())
            .into_iter()
            .take(num_keep_edges)
            .map(|j| {
                let edge = &edges_in[j];
                let op_index = argmax(arch.op_weights(edge.id).view());
                let op = EdgeOp::from_index(op_index).ok_or_else(|| {
                    FusionNasError::config(format!("operation index {} outside the candidate menu", op_index))
                })?;
                Ok(GenotypeEdge { source: edge.source, op })
            })
            .collect::<Result<Vec<_>>>()?;
        nodes.push(NodeGenotype { node: record.id, edges });
    }

    Ok(Genotype {
        nodes,
        concat: topology.output_nodes().to_vec(),
    })
}
