use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use neural_style as ns;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_image(dim: u32) -> ns::image::RgbImage {
    ns::image::RgbImage::from_fn(dim, dim, |x, y| {
        ns::image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
    })
}

/// The first two VGG16 blocks, which is enough to be representative of the
/// per pixel cost without taking minutes per sample
fn shallow_vgg() -> Arc<ns::Network> {
    Arc::new(
        ns::Network::builder(3)
            .conv("block1_conv1", 64, 3)
            .conv("block1_conv2", 64, 3)
            .max_pool("block1_pool")
            .conv("block2_conv1", 128, 3)
            .conv("block2_conv2", 128, 3)
            .build()
            .unwrap(),
    )
}

fn forward(c: &mut Criterion) {
    static DIM: u32 = 16;

    let network = shallow_vgg();
    let layers = ns::LayerSet::new(vec!["block2_conv2"]);
    let normalization = ns::Normalization::default();

    let mut group = c.benchmark_group("forward");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        let input = normalization.to_tensor(&test_image(*dim));

        group.bench_with_input(BenchmarkId::from_parameter(dim), &input, |b, input| {
            b.iter(|| black_box(ns::FeatureExtractor::extract(&*network, input, &layers)));
        });
    }
    group.finish();
}

fn loss_and_gradient(c: &mut Criterion) {
    static DIM: u32 = 16;

    let network = shallow_vgg();
    let content_layers = ns::LayerSet::new(vec!["block2_conv2"]);
    let style_layers = ns::LayerSet::new(vec!["block1_conv1", "block2_conv1"]);
    let normalization = ns::Normalization::default();

    let mut group = c.benchmark_group("loss_and_gradient");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        let content = normalization.to_tensor(&test_image(*dim));
        let style = normalization.to_tensor(&ns::image::imageops::rotate90(&test_image(*dim)));

        let targets = ns::Targets::compute(
            &*network,
            &content,
            &style,
            &content_layers,
            &style_layers,
        )
        .unwrap();
        let engine = ns::LossEngine::new(&*network, &targets, ns::LossWeights::default());

        group.bench_with_input(BenchmarkId::from_parameter(dim), &content, |b, content| {
            b.iter(|| black_box(engine.evaluate(content)));
        });
    }
    group.finish();
}

fn full_run(c: &mut Criterion) {
    static DIM: u32 = 16;

    let network = shallow_vgg();
    let content = test_image(4 * DIM);
    let style = ns::image::imageops::rotate90(&content);

    let mut group = c.benchmark_group("full_run");
    group.sample_size(10);

    for iterations in [1, 5, 10].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(iterations),
            iterations,
            |b, &iterations| {
                b.iter_custom(|iters| {
                    let mut total_elapsed = Duration::new(0, 0);
                    for _i in 0..iters {
                        let sess = ns::Session::builder()
                            .extractor(network.clone())
                            .content(content.clone())
                            .style(style.clone())
                            .content_layers(vec!["block2_conv2"])
                            .style_layers(vec!["block1_conv1", "block2_conv1"])
                            .iterations(iterations)
                            .build()
                            .unwrap();

                        let start = Instant::now();
                        black_box(sess.run(None, None).unwrap());
                        total_elapsed += start.elapsed();
                    }

                    total_elapsed
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, forward, loss_and_gradient, full_run);
criterion_main!(benches);
