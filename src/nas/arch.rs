//! Architecture parameter store
//!
//! Two groups of unconstrained logits, kept apart from network weights:
//! edge-selection logits (one vector per node, one entry per candidate
//! source) and operation-selection logits (one row per edge, one column per
//! candidate operation). Softmax is applied only when the values are
//! consumed; nothing normalized is ever stored.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::params::ParameterGroup;
use super::topology::FusionTopology;
use crate::error::{FusionNasError, Result};
use crate::tensor::{softmax, softmax_rows};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureParameters {
    edge_logits: Vec<Array1<f64>>,
    op_logits: Array2<f64>,
    /// First edge id of each node
    offsets: Vec<usize>,
}

impl ArchitectureParameters {
    /// All-zero logits (uniform after softmax)
    pub fn zeros(topology: &FusionTopology, num_ops: usize) -> Self {
        Self {
            edge_logits: topology.nodes().iter().map(|n| Array1::zeros(n.num_edges)).collect(),
            op_logits: Array2::zeros((topology.num_edges(), num_ops)),
            offsets: topology.nodes().iter().map(|n| n.first_edge).collect(),
        }
    }

    /// Small random logits around zero
    pub fn random(topology: &FusionTopology, num_ops: usize, rng: &mut impl Rng) -> Self {
        let scale = 1e-3;
        let mut arch = Self::zeros(topology, num_ops);
        for logits in arch.edge_logits.iter_mut() {
            logits.mapv_inplace(|_| (rng.gen::<f64>() - 0.5) * scale);
        }
        arch.op_logits.mapv_inplace(|_| (rng.gen::<f64>() - 0.5) * scale);
        arch
    }

    /// Same layout, zero values
    pub fn zeros_like(&self) -> Self {
        Self {
            edge_logits: self.edge_logits.iter().map(|l| Array1::zeros(l.len())).collect(),
            op_logits: Array2::zeros(self.op_logits.raw_dim()),
            offsets: self.offsets.clone(),
        }
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.edge_logits.len()
    }

    pub fn num_edges(&self) -> usize {
        self.op_logits.nrows()
    }

    pub fn num_ops(&self) -> usize {
        self.op_logits.ncols()
    }

    pub fn num_candidates(&self, node: usize) -> usize {
        self.edge_logits[node].len()
    }

    pub fn edge_logits(&self, node: usize) -> ArrayView1<'_, f64> {
        self.edge_logits[node].view()
    }

    pub fn op_logits(&self, edge: usize) -> ArrayView1<'_, f64> {
        self.op_logits.row(edge)
    }

    /// Operation logits of every edge entering `node`
    pub fn node_op_logits(&self, node: usize) -> ArrayView2<'_, f64> {
        let start = self.offsets[node];
        let end = start + self.edge_logits[node].len();
        self.op_logits.slice(s![start..end, ..])
    }

    /// Normalized keep weights over the candidate sources of `node`
    pub fn keep_weights(&self, node: usize) -> Array1<f64> {
        softmax(self.edge_logits(node))
    }

    /// Normalized operation weights of one edge
    pub fn op_weights(&self, edge: usize) -> Array1<f64> {
        softmax(self.op_logits(edge))
    }

    /// Normalized operation weights of every edge entering `node`
    pub fn node_op_weights(&self, node: usize) -> Array2<f64> {
        softmax_rows(&self.node_op_logits(node).to_owned())
    }

    pub fn set_edge_logits(&mut self, node: usize, values: &[f64]) -> Result<()> {
        let target = self
            .edge_logits
            .get_mut(node)
            .ok_or_else(|| FusionNasError::config(format!("no node {}", node)))?;
        if target.len() != values.len() {
            return Err(FusionNasError::config(format!(
                "node {} has {} candidate sources, got {} logits",
                node,
                target.len(),
                values.len()
            )));
        }
        target.assign(&ArrayView1::from(values));
        Ok(())
    }

    pub fn set_op_logits(&mut self, edge: usize, values: &[f64]) -> Result<()> {
        if edge >= self.num_edges() || values.len() != self.num_ops() {
            return Err(FusionNasError::config(format!(
                "edge {} expects {} operation logits, got {}",
                edge,
                self.num_ops(),
                values.len()
            )));
        }
        self.op_logits.row_mut(edge).assign(&ArrayView1::from(values));
        Ok(())
    }

    /// Accumulate a gradient w.r.t. the logits of `node`
    pub(crate) fn accumulate_edge(&mut self, node: usize, grad: &Array1<f64>) {
        self.edge_logits[node] += grad;
    }

    /// Accumulate gradients w.r.t. the operation logits of `node`'s edges
    pub(crate) fn accumulate_node_ops(&mut self, node: usize, grad: &Array2<f64>) {
        let start = self.offsets[node];
        let mut rows = self.op_logits.slice_mut(s![start..start + grad.nrows(), ..]);
        rows += grad;
    }

    /// Check that the layout matches a topology and operation count
    pub fn check_layout(&self, topology: &FusionTopology, num_ops: usize) -> Result<()> {
        let counts: Vec<usize> = self.edge_logits.iter().map(|l| l.len()).collect();
        let offsets: Vec<usize> = topology.nodes().iter().map(|n| n.first_edge).collect();
        if counts != topology.candidate_counts()
            || self.offsets != offsets
            || self.op_logits.dim() != (topology.num_edges(), num_ops)
        {
            return Err(FusionNasError::config(format!(
                "architecture parameters {:?}/{:?} do not match topology {:?}/{:?}",
                counts,
                self.op_logits.dim(),
                topology.candidate_counts(),
                (topology.num_edges(), num_ops)
            )));
        }
        Ok(())
    }
}

impl ParameterGroup for ArchitectureParameters {
    fn tensors(&self) -> Vec<ArrayView2<'_, f64>> {
        let mut views: Vec<ArrayView2<'_, f64>> =
            self.edge_logits.iter().map(|l| l.view().insert_axis(Axis(0))).collect();
        views.push(self.op_logits.view());
        views
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMut2<'_, f64>> {
        let mut views: Vec<ArrayViewMut2<'_, f64>> =
            self.edge_logits.iter_mut().map(|l| l.view_mut().insert_axis(Axis(0))).collect();
        views.push(self.op_logits.view_mut());
        views
    }
}
