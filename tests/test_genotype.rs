//! Integration test: genotype decoding

use kolosal_fusion_nas::config::SearchConfig;
use kolosal_fusion_nas::context::RunContext;
use kolosal_fusion_nas::error::FusionNasError;
use kolosal_fusion_nas::nas::{
    derive_genotype, ArchitectureParameters, EdgeOp, FusionTopology, Genotype, SourceRef,
};
use rand::prelude::*;

fn topology(inputs: usize, steps: usize, keep: usize) -> FusionTopology {
    let config = SearchConfig::default()
        .with_topology(inputs, steps, keep)
        .with_multiplier(1);
    FusionTopology::from_config(&config).unwrap()
}

#[test]
fn test_decoding_is_deterministic() {
    let topo = topology(4, 3, 2);
    let mut ctx = RunContext::cpu(21);
    let arch = ArchitectureParameters::random(&topo, EdgeOp::count(), ctx.rng());
    let a = derive_genotype(&topo, &arch, 2).unwrap();
    let b = derive_genotype(&topo, &arch.snapshot(), 2).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
}

#[test]
fn test_ties_pick_lowest_index() {
    let topo = topology(3, 1, 2);
    let mut arch = ArchitectureParameters::zeros(&topo, EdgeOp::count());
    arch.set_edge_logits(0, &[0.0, 1.0, 1.0]).unwrap();
    arch.set_op_logits(1, &[0.0, 2.0, 2.0, 0.0, 0.0]).unwrap();
    let genotype = derive_genotype(&topo, &arch, 2).unwrap();
    let edges = &genotype.nodes[0].edges;
    assert_eq!(edges[0].source, SourceRef::Input(1));
    assert_eq!(edges[0].op, EdgeOp::Identity);
    assert_eq!(edges[1].source, SourceRef::Input(2));
}

#[test]
fn test_selection_count_is_min_of_keep_and_candidates() {
    let mut ctx = RunContext::cpu(22);
    for (inputs, steps, keep) in [(2, 4, 3), (3, 2, 2), (1, 3, 3), (5, 1, 5)] {
        let topo = topology(inputs, steps, keep);
        let arch = ArchitectureParameters::random(&topo, EdgeOp::count(), ctx.rng());
        let genotype = derive_genotype(&topo, &arch, keep).unwrap();
        for (node, decoded) in topo.nodes().iter().zip(genotype.nodes.iter()) {
            assert_eq!(decoded.edges.len(), keep.min(node.num_edges));
        }
    }
}

#[test]
fn test_three_inputs_one_step_keeps_two() {
    let topo = topology(3, 1, 2);
    assert_eq!(topo.edges_into(0).len(), 3);
    let mut ctx = RunContext::cpu(23);
    for _ in 0..10 {
        let mut arch = ArchitectureParameters::zeros(&topo, EdgeOp::count());
        let logits: Vec<f64> = (0..3).map(|_| ctx.rng().gen::<f64>()).collect();
        arch.set_edge_logits(0, &logits).unwrap();
        let weakest = (0..3)
            .min_by(|&a, &b| logits[a].total_cmp(&logits[b]))
            .unwrap();

        let genotype = derive_genotype(&topo, &arch, 2).unwrap();
        let kept: Vec<SourceRef> = genotype.nodes[0].edges.iter().map(|e| e.source).collect();
        assert_eq!(kept.len(), 2);
        assert!(!kept.contains(&SourceRef::Input(weakest)));
    }
}

#[test]
fn test_insufficient_candidates_rejected_eagerly() {
    let config = SearchConfig::default().with_topology(3, 1, 5).with_multiplier(1);
    assert!(matches!(
        FusionTopology::from_config(&config),
        Err(FusionNasError::Configuration(_))
    ));
}

#[test]
fn test_genotype_json_roundtrip() {
    let topo = topology(3, 2, 2);
    let mut ctx = RunContext::cpu(24);
    let arch = ArchitectureParameters::random(&topo, EdgeOp::count(), ctx.rng());
    let genotype = derive_genotype(&topo, &arch, 2).unwrap();
    let parsed = Genotype::from_json(&genotype.to_json().unwrap()).unwrap();
    assert_eq!(parsed, genotype);
    assert_eq!(parsed.num_edges(), 4);
    assert_eq!(parsed.concat, vec![1]);
}
