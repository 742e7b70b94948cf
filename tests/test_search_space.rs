//! Integration test: fusion graph relaxation

use kolosal_fusion_nas::config::SearchConfig;
use kolosal_fusion_nas::context::RunContext;
use kolosal_fusion_nas::error::FusionNasError;
use kolosal_fusion_nas::nas::{
    ArchitectureParameters, EdgeOp, FusionCell, FusionTopology, MixedOp, ParamStore, SourceRef,
};
use ndarray::{Array1, Array3};
use rand::prelude::*;

fn modality_inputs(ctx: &mut RunContext, n: usize, shape: (usize, usize, usize)) -> Vec<Array3<f64>> {
    (0..n)
        .map(|_| Array3::from_shape_fn(shape, |_| ctx.rng().gen::<f64>() * 2.0 - 1.0))
        .collect()
}

#[test]
fn test_weights_normalize_after_forward() {
    let config = SearchConfig::default()
        .with_topology(3, 3, 2)
        .with_multiplier(2)
        .with_node_steps(2, 2)
        .with_shape(4, 5);
    let mut ctx = RunContext::cpu(11);
    let mut store = ParamStore::new();
    let cell = FusionCell::new(&config, &mut store, ctx.rng()).unwrap();

    // large, uneven logits
    let mut arch = ArchitectureParameters::zeros(cell.topology(), EdgeOp::count());
    for node in 0..arch.num_nodes() {
        let logits: Vec<f64> = (0..arch.num_candidates(node)).map(|_| ctx.rng().gen::<f64>() * 40.0 - 20.0).collect();
        arch.set_edge_logits(node, &logits).unwrap();
    }
    for edge in 0..arch.num_edges() {
        let logits: Vec<f64> = (0..EdgeOp::count()).map(|_| ctx.rng().gen::<f64>() * 40.0 - 20.0).collect();
        arch.set_op_logits(edge, &logits).unwrap();
    }

    let inputs = modality_inputs(&mut ctx, 3, (2, 4, 5));
    let (out, cache) = cell.forward(&inputs, &arch, &store).unwrap();
    assert_eq!(out.dim(), (2, 8, 5));
    for weights in cache.weights() {
        assert!((weights.keep.sum() - 1.0).abs() < 1e-9);
        assert!(weights.keep.iter().all(|&w| w >= 0.0));
        for row in weights.ops.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }
}

#[test]
fn test_one_hot_weights_collapse_to_chosen_op() {
    let mut ctx = RunContext::cpu(12);
    let mut store = ParamStore::new();
    let mixed = MixedOp::new(3, 6, &mut store, ctx.rng(), "edge");
    let x = modality_inputs(&mut ctx, 1, (4, 3, 6)).remove(0);

    for op in EdgeOp::ALL {
        let mut weights = Array1::zeros(EdgeOp::count());
        weights[op.index()] = 1.0;
        let (mixed_out, _) = mixed.forward(&x, weights.view(), &store).unwrap();
        let (expected, _) = mixed.ops()[op.index()].forward(&x, &store);
        assert_eq!(mixed_out, expected, "{} did not collapse", op);
    }
}

#[test]
fn test_mixed_op_rejects_undeclared_shape() {
    let mut ctx = RunContext::cpu(13);
    let mut store = ParamStore::new();
    let mixed = MixedOp::new(3, 6, &mut store, ctx.rng(), "edge");
    let x = Array3::zeros((2, 3, 7));
    let weights = Array1::from_elem(EdgeOp::count(), 0.2);
    assert!(matches!(
        mixed.forward(&x, weights.view(), &store),
        Err(FusionNasError::Configuration(_))
    ));
}

#[test]
fn test_first_node_sees_only_raw_inputs() {
    let config = SearchConfig::default().with_topology(3, 1, 2).with_multiplier(1);
    let topology = FusionTopology::from_config(&config).unwrap();
    assert_eq!(topology.num_nodes(), 1);
    let sources: Vec<SourceRef> = topology.edges_into(0).iter().map(|e| e.source).collect();
    assert_eq!(sources, vec![SourceRef::Input(0), SourceRef::Input(1), SourceRef::Input(2)]);
}

#[test]
fn test_fewer_candidates_than_keep_edges_normalize_without_padding() {
    // node 0 has 2 candidates, keep is 3
    let config = SearchConfig::default().with_topology(2, 2, 3).with_multiplier(1);
    let topology = FusionTopology::from_config(&config).unwrap();
    let arch = ArchitectureParameters::zeros(&topology, EdgeOp::count());
    let keep = arch.keep_weights(0);
    assert_eq!(keep.len(), 2);
    assert!((keep[0] - 0.5).abs() < 1e-12);
}

#[test]
fn test_forward_is_pure() {
    let config = SearchConfig::default().with_topology(2, 2, 2).with_shape(3, 3);
    let mut ctx = RunContext::cpu(14);
    let mut store = ParamStore::new();
    let cell = FusionCell::new(&config, &mut store, ctx.rng()).unwrap();
    let arch = ArchitectureParameters::random(cell.topology(), EdgeOp::count(), ctx.rng());
    let inputs = modality_inputs(&mut ctx, 2, (2, 3, 3));

    let (store_before, arch_before) = (store.clone(), arch.clone());
    let (a, _) = cell.forward(&inputs, &arch, &store).unwrap();
    let (b, _) = cell.forward(&inputs, &arch, &store).unwrap();
    assert_eq!(a, b);
    assert_eq!(store, store_before);
    assert_eq!(arch, arch_before);
}
