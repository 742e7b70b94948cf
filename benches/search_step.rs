use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_fusion_nas::nas::Mode;
use kolosal_fusion_nas::prelude::*;

fn bench_config(channels: usize) -> SearchConfig {
    SearchConfig::default()
        .with_topology(4, 3, 2)
        .with_multiplier(2)
        .with_shape(channels, 8)
        .with_outputs(10, TaskKind::MultiLabel)
        .with_batchsize(16)
}

fn bench_loss_and_grads(c: &mut Criterion) {
    let mut group = c.benchmark_group("loss_and_grads");
    group.sample_size(10);

    for channels in [8, 16, 32].iter() {
        let config = bench_config(*channels);
        let mut ctx = RunContext::cpu(1);
        let (network, params) = SearchNetwork::new(&config, &mut ctx).unwrap();
        let arch = network.init_arch(&mut ctx);
        let data = InMemoryDataset::synthetic(&config, 16, ctx.rng()).unwrap();
        let batch = data.batch(0).unwrap();

        group.bench_with_input(BenchmarkId::new("serial", channels), &batch, |b, batch| {
            b.iter(|| {
                network
                    .loss_and_grads(black_box(batch), &arch, &params, Mode::Train { seed: 3 })
                    .unwrap()
            })
        });
        group.bench_with_input(BenchmarkId::new("sharded_4", channels), &batch, |b, batch| {
            b.iter(|| {
                network
                    .loss_and_grads_sharded(black_box(batch), &arch, &params, Some(&[1, 2, 3, 4]), 4)
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_search_epoch(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_epoch");
    group.sample_size(10);

    let config = bench_config(8).with_epochs(1);
    let mut ctx = RunContext::cpu(2);
    let train = InMemoryDataset::synthetic(&config, 64, ctx.rng()).unwrap();
    let valid = InMemoryDataset::synthetic(&config, 32, ctx.rng()).unwrap();

    for mode in [ArchGradient::FirstOrder, ArchGradient::SecondOrder] {
        let config = config.clone().with_arch_gradient(mode);
        group.bench_function(format!("{:?}", mode), |b| {
            b.iter(|| {
                let mut searcher =
                    BilevelSearcher::new(config.clone(), Device::Cpu, RecordingProgress::new()).unwrap();
                searcher.search(black_box(&train), &valid).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let config = SearchConfig::default().with_topology(8, 8, 3);
    let topology = FusionTopology::from_config(&config).unwrap();
    let mut ctx = RunContext::cpu(3);
    let arch = ArchitectureParameters::random(&topology, EdgeOp::count(), ctx.rng());

    c.bench_function("derive_genotype", |b| {
        b.iter(|| derive_genotype(black_box(&topology), black_box(&arch), 3).unwrap())
    });
}

criterion_group!(benches, bench_loss_and_grads, bench_search_epoch, bench_decode);
criterion_main!(benches);
