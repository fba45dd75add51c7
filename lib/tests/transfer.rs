use neural_style as ns;
use ns::{Block, FeatureExtractor, LayerSelection, LossNetwork, Normalization, Pooling, Tensor};

/// A scaled down VGG with the same layer naming, so the default layer
/// selection can be used without a checkpoint
const COMPACT: &[Block] = &[
    Block::Conv(8),
    Block::Conv(8),
    Block::Pool,
    Block::Conv(16),
    Block::Conv(16),
    Block::Pool,
    Block::Conv(16),
];

fn compact_network() -> FeatureExtractor {
    FeatureExtractor::from_blocks(
        COMPACT,
        &ns::RandomWeights::new(42),
        &LayerSelection::default(),
        Pooling::Max,
    )
    .unwrap()
}

fn stripes(size: usize) -> Tensor {
    let mut img = Tensor::solid(size, size, [0.0; 3]);
    let plane = size * size;
    for (i, v) in img.as_mut_slice().iter_mut().enumerate() {
        let c = i / plane;
        let x = (i % plane) % size;
        let y = (i % plane) / size;
        *v = if (x / 4 + y / 8 + c) % 2 == 0 { 0.9 } else { 0.1 };
    }
    img
}

fn in_range(t: &Tensor) -> bool {
    t.as_slice().iter().all(|v| (0.0..=1.0).contains(v))
}

#[test]
fn blue_content_red_style() {
    let network = compact_network();
    let content = Tensor::solid(128, 128, [0.0, 0.0, 1.0]);
    let style = Tensor::solid(128, 128, [1.0, 0.0, 0.0]);

    let run = || {
        ns::run_style_transfer(
            &network,
            ns::IMAGENET_MEAN,
            ns::IMAGENET_STD,
            &content,
            &style,
            content.clone(),
            10,
        )
        .unwrap()
    };

    let first = run();
    assert_eq!(first.dims(), [1, 3, 128, 128]);
    assert!(in_range(&first));

    // no hidden randomness, the same inputs give the same output
    let second = run();
    assert_eq!(first, second);
}

#[test]
fn mismatched_sizes_fail_before_any_step() {
    let network = compact_network();
    let content = Tensor::solid(128, 128, [0.0, 0.0, 1.0]);
    let style = Tensor::solid(64, 64, [1.0, 0.0, 0.0]);

    let mut steps_taken = 0;
    let mut progress = |_: ns::ProgressUpdate<'_>| steps_taken += 1;

    let result = ns::run_style_transfer_with(
        &network,
        ns::IMAGENET_MEAN,
        ns::IMAGENET_STD,
        &content,
        &style,
        content.clone(),
        10,
        &ns::TransferOptions::default(),
        Some(&mut progress),
    );

    assert!(matches!(result, Err(ns::Error::SizeMismatch(_))));
    assert_eq!(steps_taken, 0);
}

#[test]
fn negative_step_count_is_rejected() {
    assert!(matches!(
        ns::step_count(-1),
        Err(ns::Error::InvalidStepCount(-1))
    ));
}

#[test]
fn loss_goes_down() {
    let network = compact_network();
    let content = Tensor::solid(32, 32, [0.2, 0.6, 0.3]);
    let style = stripes(32);

    let output = ns::run_style_transfer_with(
        &network,
        ns::IMAGENET_MEAN,
        ns::IMAGENET_STD,
        &content,
        &style,
        content.clone(),
        20,
        &ns::TransferOptions::default(),
        None,
    )
    .unwrap();

    assert_eq!(output.history.len(), 20);
    let first = output.history[0].total;
    let last = output.history[19].total;
    assert!(last < first, "loss went from {} to {}", first, last);
    assert!(output.history.iter().all(|l| l.total.is_finite()));
}

#[test]
fn canvas_invariants_hold_every_step() {
    let network = compact_network();
    let content = stripes(24);
    let style = Tensor::solid(24, 24, [0.9, 0.8, 0.1]);

    let loss = LossNetwork::new(
        &network,
        Normalization::imagenet(),
        &content,
        &style,
        ns::LossWeights::default(),
    )
    .unwrap();

    let mut transfer =
        ns::StyleTransfer::new(loss, content.clone(), 5, ns::OptimizerKind::default().build())
            .unwrap();

    // the canvas starts out as the initializer
    assert_eq!(transfer.canvas(), &content);

    while transfer.step().is_some() {
        assert_eq!(transfer.canvas().shape(), content.shape());
        assert!(in_range(transfer.canvas()));
    }

    assert_eq!(transfer.state(), ns::TransferState::Exhausted);
    let output = transfer.finish();
    assert_eq!(output.shape(), content.shape());
}

#[test]
fn gram_is_symmetric() {
    let features = stripes(9);
    let g = ns::gram(&features).unwrap();

    for i in 0..g.channels() {
        for j in 0..g.channels() {
            assert!((g.get(i, j) - g.get(j, i)).abs() < 1e-6);
        }
        assert!(g.get(i, i) >= 0.0);
    }
}

#[test]
fn thread_count_does_not_change_result() {
    let content = stripes(16);
    let style = Tensor::solid(16, 16, [0.1, 0.9, 0.4]);

    let run = |threads: usize| {
        let network = compact_network().with_max_threads(threads);
        ns::run_style_transfer(
            &network,
            ns::IMAGENET_MEAN,
            ns::IMAGENET_STD,
            &content,
            &style,
            content.clone(),
            3,
        )
        .unwrap()
    };

    assert_eq!(run(1), run(4));
}

// Runs the full VGG-19 topology, which takes half a minute in debug builds.
// `cargo test --release -- --ignored` to include it.
#[test]
#[ignore = "slow, runs the full VGG-19 topology"]
fn full_vgg19_with_random_weights() {
    let network = FeatureExtractor::vgg19(
        &ns::RandomWeights::new(42),
        &LayerSelection::default(),
        Pooling::Max,
    )
    .unwrap();

    // the default selection ends at conv_5, nothing deeper is built
    assert_eq!(
        network.layer_names().last().map(String::as_str),
        Some("conv_5")
    );

    let content = Tensor::solid(128, 128, [0.0, 0.0, 1.0]);
    let style = Tensor::solid(128, 128, [1.0, 0.0, 0.0]);

    let mut in_range_every_step = true;
    let mut progress = |update: ns::ProgressUpdate<'_>| {
        in_range_every_step &= in_range(update.canvas);
    };

    let output = ns::run_style_transfer_with(
        &network,
        ns::IMAGENET_MEAN,
        ns::IMAGENET_STD,
        &content,
        &style,
        content.clone(),
        10,
        &ns::TransferOptions::default(),
        Some(&mut progress),
    )
    .unwrap();

    assert!(in_range_every_step);
    assert_eq!(output.image.dims(), [1, 3, 128, 128]);
    assert!(in_range(&output.image));
    assert_eq!(output.history.len(), 10);

    let first = output.history[0].total;
    let last = output.history[9].total;
    assert!(last < first, "{} -> {}", first, last);
}
