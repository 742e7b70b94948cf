//! Fusion cell: the searchable DAG over modality features
//!
//! Raw modality inputs and node outputs form a growing list of states. Node
//! `i` consumes every state produced before it (all raw inputs plus nodes
//! `0..i`), so the first node only sees the raw inputs. The cell output is
//! the channel concatenation of the last `multiplier` node outputs.

use ndarray::{Array1, Array2, Array3};
use rand::Rng;

use super::arch::ArchitectureParameters;
use super::node::{FusionNode, NodeCache};
use super::params::ParamStore;
use super::topology::FusionTopology;
use crate::config::SearchConfig;
use crate::error::{FusionNasError, Result};
use crate::tensor::{concat_channels, softmax_backward, split_channels};

/// Normalized weights consumed by one node in a forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct NodeWeights {
    /// Keep weight per candidate source; sums to one
    pub keep: Array1<f64>,
    /// Operation weights per candidate source; each row sums to one
    pub ops: Array2<f64>,
}

/// Backward cache of a [`FusionCell`]
#[derive(Debug, Clone)]
pub struct CellCache {
    weights: Vec<NodeWeights>,
    node_caches: Vec<NodeCache>,
}

impl CellCache {
    /// Weights the forward pass actually used
    pub fn weights(&self) -> &[NodeWeights] {
        &self.weights
    }
}

#[derive(Debug, Clone)]
pub struct FusionCell {
    topology: FusionTopology,
    nodes: Vec<FusionNode>,
    channels: usize,
    length: usize,
}

impl FusionCell {
    /// Build the topology and register every node's weights
    pub fn new(config: &SearchConfig, store: &mut ParamStore, rng: &mut impl Rng) -> Result<Self> {
        let topology = FusionTopology::from_config(config)?;
        let nodes = topology
            .nodes()
            .iter()
            .map(|record| {
                FusionNode::new(
                    record.id,
                    record.num_edges,
                    config.node_steps,
                    config.node_multiplier,
                    config.channels,
                    config.length,
                    store,
                    rng,
                )
            })
            .collect();
        Ok(Self {
            topology,
            nodes,
            channels: config.channels,
            length: config.length,
        })
    }

    pub fn topology(&self) -> &FusionTopology {
        &self.topology
    }

    pub fn nodes(&self) -> &[FusionNode] {
        &self.nodes
    }

    /// Channels of the cell output
    pub fn output_channels(&self) -> usize {
        self.topology.output_nodes().len() * self.channels
    }

    /// Softmax-normalized weights for every node
    pub fn normalized_weights(&self, arch: &ArchitectureParameters) -> Vec<NodeWeights> {
        (0..self.nodes.len())
            .map(|i| NodeWeights {
                keep: arch.keep_weights(i),
                ops: arch.node_op_weights(i),
            })
            .collect()
    }

    /// Modality count and `[B, C, L]` shape check
    pub fn check_inputs(&self, inputs: &[Array3<f64>]) -> Result<()> {
        let expected = self.topology.num_input_nodes();
        if inputs.len() != expected {
            return Err(FusionNasError::data(format!(
                "expected {} modality inputs, got {}",
                expected,
                inputs.len()
            )));
        }
        let batch = inputs[0].dim().0;
        for (m, x) in inputs.iter().enumerate() {
            let (b, c, l) = x.dim();
            if b != batch || c != self.channels || l != self.length {
                return Err(FusionNasError::data(format!(
                    "modality {} has shape [{}, {}, {}], expected [{}, {}, {}]",
                    m, b, c, l, batch, self.channels, self.length
                )));
            }
        }
        Ok(())
    }

    pub fn forward(
        &self,
        inputs: &[Array3<f64>],
        arch: &ArchitectureParameters,
        store: &ParamStore,
    ) -> Result<(Array3<f64>, CellCache)> {
        self.check_inputs(inputs)?;
        let weights = self.normalized_weights(arch);
        let n = self.topology.num_input_nodes();

        let mut states: Vec<Array3<f64>> = inputs.to_vec();
        let mut node_caches = Vec::with_capacity(self.nodes.len());
        for (node, w) in self.nodes.iter().zip(weights.iter()) {
            let sources: Vec<&Array3<f64>> = states[..n + node.id()].iter().collect();
            let (out, cache) = node.forward(&sources, w.keep.view(), w.ops.view(), store)?;
            states.push(out);
            node_caches.push(cache);
        }

        let outputs: Vec<&Array3<f64>> = self.topology.output_nodes().iter().map(|&i| &states[n + i]).collect();
        Ok((concat_channels(&outputs), CellCache { weights, node_caches }))
    }

    /// Returns gradients w.r.t. the raw inputs and the architecture logits
    pub fn backward(
        &self,
        grad_out: &Array3<f64>,
        cache: &CellCache,
        arch: &ArchitectureParameters,
        store: &ParamStore,
        grads: &mut ParamStore,
    ) -> (Vec<Array3<f64>>, ArchitectureParameters) {
        let n = self.topology.num_input_nodes();
        let (batch, _, length) = grad_out.dim();
        let mut d_states: Vec<Array3<f64>> =
            vec![Array3::zeros((batch, self.channels, length)); n + self.nodes.len()];
        let outputs = self.topology.output_nodes();
        for (&node, part) in outputs.iter().zip(split_channels(grad_out, self.channels, outputs.len())) {
            d_states[n + node] += &part;
        }

        let mut d_arch = arch.zeros_like();
        for (i, node) in self.nodes.iter().enumerate().rev() {
            let w = &cache.weights[i];
            let d_out = d_states[n + i].clone();
            let (d_sources, d_keep, d_ops) =
                node.backward(&d_out, w.keep.view(), w.ops.view(), &cache.node_caches[i], store, grads);
            for (j, d) in d_sources.iter().enumerate() {
                d_states[j] += d;
            }
            d_arch.accumulate_edge(i, &softmax_backward(w.keep.view(), d_keep.view()));
            let mut d_op_logits = Array2::zeros(d_ops.raw_dim());
            for (j, mut row) in d_op_logits.rows_mut().into_iter().enumerate() {
                row.assign(&softmax_backward(w.ops.row(j), d_ops.row(j)));
            }
            d_arch.accumulate_node_ops(i, &d_op_logits);
        }

        d_states.truncate(n);
        (d_states, d_arch)
    }
}
