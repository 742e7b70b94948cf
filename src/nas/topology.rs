//! Fusion graph topology
//!
//! An arena of node and edge records addressed by integer id. Built once
//! from the configuration; weights never change it. Edges are laid out
//! contiguously per destination node, in source order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::config::SearchConfig;
use crate::error::Result;

/// Producer feeding an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRef {
    /// Raw modality feature `i`
    Input(usize),
    /// Output of internal node `i`
    Node(usize),
}

impl SourceRef {
    /// Position of this producer in the running list of cell states
    pub fn state_index(self, num_input_nodes: usize) -> usize {
        match self {
            SourceRef::Input(i) => i,
            SourceRef::Node(i) => num_input_nodes + i,
        }
    }

    /// Inverse of [`SourceRef::state_index`]
    pub fn from_state_index(index: usize, num_input_nodes: usize) -> Self {
        if index < num_input_nodes {
            SourceRef::Input(index)
        } else {
            SourceRef::Node(index - num_input_nodes)
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Input(i) => write!(f, "input {}", i),
            SourceRef::Node(i) => write!(f, "node {}", i),
        }
    }
}

/// A candidate connection into a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: usize,
    pub source: SourceRef,
    pub dest: usize,
}

/// An internal node and the span of its incoming edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: usize,
    pub first_edge: usize,
    pub num_edges: usize,
}

impl NodeRecord {
    pub fn edge_range(&self) -> Range<usize> {
        self.first_edge..self.first_edge + self.num_edges
    }
}

/// Node/edge arena of a fusion cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionTopology {
    num_input_nodes: usize,
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
    /// Nodes whose outputs are concatenated into the cell output
    output_nodes: Vec<usize>,
}

impl FusionTopology {
    /// Node `i` receives one edge from every raw input and every earlier node
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config.num_input_nodes, config.steps, config.multiplier))
    }

    fn build(num_input_nodes: usize, steps: usize, multiplier: usize) -> Self {
        let mut nodes = Vec::with_capacity(steps);
        let mut edges = Vec::new();
        for node in 0..steps {
            let first_edge = edges.len();
            let candidates = num_input_nodes + node;
            for state in 0..candidates {
                edges.push(EdgeRecord {
                    id: edges.len(),
                    source: SourceRef::from_state_index(state, num_input_nodes),
                    dest: node,
                });
            }
            nodes.push(NodeRecord {
                id: node,
                first_edge,
                num_edges: candidates,
            });
        }
        Self {
            num_input_nodes,
            nodes,
            edges,
            output_nodes: (steps - multiplier..steps).collect(),
        }
    }

    pub fn num_input_nodes(&self) -> usize {
        self.num_input_nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &NodeRecord {
        &self.nodes[id]
    }

    pub fn edge(&self, id: usize) -> &EdgeRecord {
        &self.edges[id]
    }

    /// Incoming edges of node `id`, ordered by source
    pub fn edges_into(&self, id: usize) -> &[EdgeRecord] {
        &self.edges[self.nodes[id].edge_range()]
    }

    pub fn output_nodes(&self) -> &[usize] {
        &self.output_nodes
    }

    /// Candidate count per node
    pub fn candidate_counts(&self) -> Vec<usize> {
        self.nodes.iter().map(|n| n.num_edges).collect()
    }
}

impl fmt::Display for FusionTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "FusionTopology: {} inputs, {} nodes, {} edges",
            self.num_input_nodes,
            self.nodes.len(),
            self.edges.len()
        )?;
        for node in &self.nodes {
            let sources: Vec<String> = self.edges_into(node.id).iter().map(|e| e.source.to_string()).collect();
            writeln!(f, "  node {} <- [{}]", node.id, sources.join(", "))?;
        }
        write!(f, "  output = concat{:?}", self.output_nodes)
    }
}
