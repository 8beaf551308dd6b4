//! Benchmarks for ntkrs-exec kernel strategies
//!
//! This benchmark suite measures:
//! - Each strategy on a small MLP across batch sizes
//! - Each strategy on a small CNN
//! - AUTO selection overhead (cost estimation only)

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ntkrs_ad::{stax, Network};
use ntkrs_core::{DenseND, NtTree, StructuredValue};
use ntkrs_exec::build_kernel_fn;
use ntkrs_planner::NtkImplementation;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;

const STRATEGIES: [NtkImplementation; 4] = [
    NtkImplementation::JacobianContraction,
    NtkImplementation::NtkVectorProducts,
    NtkImplementation::StructuredDerivatives,
    NtkImplementation::Auto,
];

fn batch(shape: &[usize], seed: u64) -> StructuredValue<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    NtTree::leaf(DenseND::random_normal(shape, 0.0, 1.0, &mut rng).unwrap())
}

fn mlp() -> Network<f64> {
    Network::from_boxed(stax::serial(vec![
        stax::dense(64),
        stax::relu(),
        stax::dense(64),
        stax::relu(),
        stax::dense(4),
    ]))
}

fn cnn() -> Network<f64> {
    Network::from_boxed(stax::serial(vec![
        stax::conv(8, (3, 3)),
        stax::relu(),
        stax::conv(8, (3, 3)),
        stax::relu(),
        stax::flatten(),
        stax::dense(4),
    ]))
}

/// Benchmark every strategy on an MLP
fn bench_mlp(c: &mut Criterion) {
    let mut group = c.benchmark_group("mlp_ntk");
    let net = mlp();
    let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 16])).unwrap();

    for n in [2usize, 4, 8].iter() {
        let x1 = batch(&[*n, 16], 1);
        let x2 = batch(&[*n, 16], 2);
        group.throughput(Throughput::Elements((n * n * 16) as u64));

        for implementation in STRATEGIES {
            let kernel_fn =
                build_kernel_fn(net.clone(), Vec::<isize>::new(), 0isize, implementation).unwrap();
            group.bench_with_input(
                BenchmarkId::new(implementation.name(), n),
                n,
                |b, _| {
                    b.iter(|| {
                        let k = kernel_fn
                            .call(black_box(&x2), black_box(&x1), black_box(&params))
                            .unwrap();
                        black_box(k);
                    });
                },
            );
        }
    }

    group.finish();
}

/// Benchmark every strategy on a small CNN
fn bench_cnn(c: &mut Criterion) {
    let mut group = c.benchmark_group("cnn_ntk");
    group.sample_size(10);
    let net = cnn();
    let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 8, 8, 3])).unwrap();
    let x1 = batch(&[4, 8, 8, 3], 3);
    let x2 = batch(&[2, 8, 8, 3], 4);

    for implementation in STRATEGIES {
        let kernel_fn =
            build_kernel_fn(net.clone(), Vec::<isize>::new(), 0isize, implementation).unwrap();
        group.bench_function(implementation.name(), |b| {
            b.iter(|| {
                let k = kernel_fn
                    .call(black_box(&x2), black_box(&x1), black_box(&params))
                    .unwrap();
                black_box(k);
            });
        });
    }

    group.finish();
}

/// Benchmark the cost model alone
fn bench_selection(c: &mut Criterion) {
    let net = cnn();
    let (_, params) = net.init_fn(0, &NtTree::leaf(vec![1, 8, 8, 3])).unwrap();
    let x1 = batch(&[16, 8, 8, 3], 5);
    let x2 = batch(&[16, 8, 8, 3], 6);
    let kernel_fn =
        build_kernel_fn(net, Vec::<isize>::new(), 0isize, NtkImplementation::Auto).unwrap();

    c.bench_function("auto_select", |b| {
        b.iter(|| {
            let selection = kernel_fn
                .select(black_box(&x2), black_box(&x1), black_box(&params))
                .unwrap();
            black_box(selection);
        });
    });
}

criterion_group!(benches, bench_mlp, bench_cnn, bench_selection);
criterion_main!(benches);
