use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use neural_style as ns;
use std::time::{Duration, Instant};

const COMPACT: &[ns::Block] = &[
    ns::Block::Conv(16),
    ns::Block::Conv(16),
    ns::Block::Pool,
    ns::Block::Conv(32),
    ns::Block::Conv(32),
    ns::Block::Pool,
    ns::Block::Conv(32),
];

fn network() -> ns::FeatureExtractor {
    ns::FeatureExtractor::from_blocks(
        COMPACT,
        &ns::RandomWeights::new(7),
        &ns::LayerSelection::default(),
        ns::Pooling::Max,
    )
    .unwrap()
}

fn gradient(size: usize, phase: f32) -> ns::Tensor {
    let mut img = ns::Tensor::solid(size, size, [0.0; 3]);
    let plane = size * size;
    for (i, v) in img.as_mut_slice().iter_mut().enumerate() {
        let p = (i % plane) as f32 / plane as f32;
        *v = (0.5 + 0.5 * (p * 17.0 + phase * (i / plane) as f32).sin()).max(0.0);
    }
    img
}

fn loss_evaluation(c: &mut Criterion) {
    static DIM: usize = 32;

    let network = network();

    let mut group = c.benchmark_group("loss_evaluation");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        let content = gradient(*dim, 0.0);
        let style = gradient(*dim, 1.7);
        let loss = ns::LossNetwork::new(
            &network,
            ns::Normalization::imagenet(),
            &content,
            &style,
            ns::LossWeights::default(),
        )
        .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, _| {
            let mut grad = ns::Tensor::zeros(content.shape());
            b.iter(|| black_box(loss.evaluate(&content, &mut grad).unwrap()));
        });
    }
    group.finish();
}

fn style_transfer(c: &mut Criterion) {
    static DIM: usize = 32;

    let network = network();

    let mut group = c.benchmark_group("style_transfer");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM].iter() {
        let content = gradient(*dim, 0.0);
        let style = gradient(*dim, 1.7);

        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, _| {
            b.iter_custom(|iters| {
                let mut total_elapsed = Duration::new(0, 0);
                for _i in 0..iters {
                    let canvas = content.clone();

                    let start = Instant::now();
                    black_box(
                        ns::run_style_transfer(
                            &network,
                            ns::IMAGENET_MEAN,
                            ns::IMAGENET_STD,
                            &content,
                            &style,
                            canvas,
                            10,
                        )
                        .unwrap(),
                    );
                    total_elapsed += start.elapsed();
                }

                total_elapsed
            });
        });
    }
    group.finish();
}

fn gram(c: &mut Criterion) {
    let mut group = c.benchmark_group("gram");

    for channels in [64usize, 128, 256].iter() {
        let shape = ns::Shape::new(*channels, 32, 32);
        let data = (0..shape.len()).map(|i| (i % 13) as f32 / 13.0).collect();
        let features = ns::Tensor::from_vec(shape, data).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(channels), channels, |b, _| {
            b.iter(|| black_box(ns::gram(&features).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, loss_evaluation, style_transfer, gram);
criterion_main!(benches);
