use neural_style::{
    image::{Rgb, RgbImage},
    CancelToken, ChannelProgress, Error, FeatureExtractor, FeatureMaps, LayerSet, Network,
    ProgressUpdate, RunStatus, Session, SessionBuilder, Tensor,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

fn small_network() -> Arc<Network> {
    Arc::new(
        Network::builder(3)
            .seed(7)
            .conv("block1_conv1", 8, 3)
            .max_pool("block1_pool")
            .conv("block2_conv1", 8, 3)
            .build()
            .unwrap(),
    )
}

fn checkerboard(size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |x, y| {
        if (x / 2 + y / 2) % 2 == 0 {
            Rgb([230, 200, 40])
        } else {
            Rgb([20, 60, 160])
        }
    })
}

fn gradient(size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |x, y| {
        Rgb([(x * 255 / size) as u8, (y * 255 / size) as u8, 128])
    })
}

fn session<'a>(extractor: Arc<dyn FeatureExtractor>) -> SessionBuilder<'a> {
    Session::builder()
        .extractor(extractor)
        .content(gradient(16))
        .style(checkerboard(16))
        .content_layers(vec!["block2_conv1"])
        .style_layers(vec!["block1_conv1", "block2_conv1"])
}

#[test]
fn zero_iterations_returns_content() {
    let result = session(small_network())
        .iterations(0)
        .build()
        .unwrap()
        .run(None, None)
        .unwrap();

    assert!(result.is_completed());
    assert_eq!(result.iterations_run(), 0);
    assert_eq!(result.best_iteration(), Some(0));
    assert_eq!(result.image(), &gradient(16));
}

#[test]
fn more_iterations_never_increase_loss() {
    let run = |iterations| {
        session(small_network())
            .iterations(iterations)
            .build()
            .unwrap()
            .run(None, None)
            .unwrap()
    };

    let short = run(5);
    let long = run(10);

    assert!(short.is_completed() && long.is_completed());
    assert_eq!(long.iterations_run(), 10);
    assert!(long.loss().unwrap().total <= short.loss().unwrap().total);
}

#[test]
fn cancels_between_iterations() {
    let token = CancelToken::new();
    let canceller = token.clone();

    let progress = move |info: ProgressUpdate<'_>| {
        if info.iteration.current == 3 {
            canceller.cancel();
        }
    };

    let result = session(small_network())
        .iterations(50)
        .build()
        .unwrap()
        .run(Some(Box::new(progress)), Some(&token))
        .unwrap();

    assert!(matches!(result.status(), RunStatus::Cancelled));
    assert_eq!(result.iterations_run(), 3);
    assert!(result.best_iteration().unwrap() <= 3);
}

#[test]
fn cancelled_before_start_returns_content() {
    let token = CancelToken::new();
    token.cancel();

    let result = session(small_network())
        .build()
        .unwrap()
        .run(None, Some(&token))
        .unwrap();

    assert!(matches!(result.status(), RunStatus::Cancelled));
    assert_eq!(result.iterations_run(), 0);
    assert!(result.loss().is_none());
    assert_eq!(result.image(), &gradient(16));
}

/// A 1x1 convolution whose channels are each color channel rectified in
/// both directions, so that matching Gram matrices means matching colors
fn split_rectifier() -> Arc<Network> {
    let mut weights = vec![0.0; 6 * 3];
    for k in 0..6 {
        weights[k * 3 + k % 3] = if k < 3 { 1.0 } else { -1.0 };
    }

    Arc::new(
        Network::builder(3)
            .conv_with_weights("block1_conv1", 6, 1, true, weights, vec![0.0; 6])
            .build()
            .unwrap(),
    )
}

fn mean_color(img: &RgbImage) -> [f64; 3] {
    let mut sum = [0.0; 3];
    for pixel in img.pixels() {
        for (s, v) in sum.iter_mut().zip(pixel.0.iter()) {
            *s += f64::from(*v);
        }
    }
    let count = f64::from(img.width() * img.height());
    [sum[0] / count, sum[1] / count, sum[2] / count]
}

#[test]
fn gray_takes_on_red_style() {
    let gray = RgbImage::from_pixel(256, 256, Rgb([128, 128, 128]));
    let red = RgbImage::from_pixel(256, 256, Rgb([255, 0, 0]));

    let result = Session::builder()
        .extractor(split_rectifier())
        .content(gray)
        .style(red)
        .content_layers(vec!["block1_conv1"])
        .style_layers(vec!["block1_conv1"])
        .content_weight(1.0)
        .style_weight(1.0)
        .iterations(50)
        .snapshot_interval(50)
        .build()
        .unwrap()
        .run(None, None)
        .unwrap();

    assert!(result.is_completed());

    let snapshots = result.snapshots();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].iteration, 0);
    assert_eq!(snapshots[1].iteration, 50);
    assert!(snapshots[1].loss.total <= snapshots[0].loss.total);

    let [r, g, b] = mean_color(result.image());
    assert!(r > 170.0, "red {}", r);
    assert!(g < 128.0, "green {}", g);
    assert!(b < 128.0, "blue {}", b);
}

/// Wraps a network and counts how often it is run
struct Counting {
    inner: Arc<Network>,
    calls: Arc<AtomicUsize>,
}

impl FeatureExtractor for Counting {
    fn layer_names(&self) -> Vec<&str> {
        self.inner.layer_names()
    }

    fn input_channels(&self) -> usize {
        self.inner.input_channels()
    }

    fn extract(&self, input: &Tensor, layers: &LayerSet) -> Result<FeatureMaps, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.extract(input, layers)
    }

    fn backward(&self, input: &Tensor, output_grads: &FeatureMaps) -> Result<Tensor, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.backward(input, output_grads)
    }

    fn min_input_size(&self, layers: &LayerSet) -> usize {
        self.inner.min_input_size(layers)
    }
}

#[test]
fn unknown_layer_fails_before_running_anything() {
    let calls = Arc::new(AtomicUsize::new(0));
    let extractor = Arc::new(Counting {
        inner: small_network(),
        calls: calls.clone(),
    });

    let err = session(extractor)
        .style_layers(vec!["block1_conv1", "block9_conv9"])
        .build()
        .err()
        .unwrap();

    assert!(err.is_configuration());
    assert!(matches!(err, Error::UnknownLayer(ref name) if name == "block9_conv9"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn too_small_style_fails_before_running_anything() {
    let calls = Arc::new(AtomicUsize::new(0));
    let extractor = Arc::new(Counting {
        inner: small_network(),
        calls: calls.clone(),
    });

    // block2_conv1 sits behind a pool, which needs a 2x2 input
    let err = session(extractor)
        .style(RgbImage::from_pixel(1, 1, Rgb([255, 0, 0])))
        .build()
        .err()
        .unwrap();

    assert!(err.is_input());
    assert!(err.to_string().contains("style image"), "{}", err);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn rejects_invalid_weight() {
    let err = session(small_network())
        .content_weight(-1.0)
        .build()
        .err()
        .unwrap();

    assert!(matches!(err, Error::InvalidRange(_)));
    assert!(err.to_string().contains("content-weight"));
}

#[test]
fn missing_file_is_an_input_error() {
    let err = session(small_network())
        .style(&"does/not/exist.png")
        .build()
        .err()
        .unwrap();

    assert!(err.is_input());
}

#[test]
fn shared_network_runs_concurrently() {
    let network = small_network();

    let run = |network: Arc<Network>| {
        session(network)
            .iterations(4)
            .build()
            .unwrap()
            .run(None, None)
            .unwrap()
            .into_image()
    };

    let expected = run(network.clone());

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let network = network.clone();
            std::thread::spawn(move || run(network))
        })
        .collect();

    for handle in handles {
        let img = handle.join().unwrap();
        assert_eq!(img.to_rgb8(), expected.to_rgb8());
    }
}

#[test]
fn thread_count_does_not_change_result() {
    let run = |threads| {
        let network = Network::builder(3)
            .seed(7)
            .conv("block1_conv1", 8, 3)
            .max_pool("block1_pool")
            .conv("block2_conv1", 8, 3)
            .build()
            .unwrap()
            .with_max_thread_count(threads);

        session(Arc::new(network))
            .iterations(3)
            .build()
            .unwrap()
            .run(None, None)
            .unwrap()
    };

    let single = run(1);
    let many = run(4);
    assert_eq!(single.image(), many.image());
    assert_eq!(single.loss(), many.loss());
}

#[test]
fn progress_over_channel() {
    let (progress, receiver) = ChannelProgress::bounded(16);

    let result = session(small_network())
        .iterations(4)
        .snapshot_count(2)
        .build()
        .unwrap()
        .run(Some(Box::new(progress)), None)
        .unwrap();

    let events: Vec<_> = receiver.try_iter().collect();
    assert_eq!(events.len(), 5);

    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.iteration.current, i + 1);
        assert_eq!(event.iteration.total, 5);
        assert!(event.best_loss.total <= event.loss.total);
    }

    for pair in events.windows(2) {
        assert!(pair[1].best_loss.total <= pair[0].best_loss.total);
        assert!(pair[1].best_iteration >= pair[0].best_iteration);
    }

    // snapshots every 2 iterations, plus the last one
    let snapshot_iterations: Vec<_> = events
        .iter()
        .filter_map(|e| e.snapshot.as_ref().map(|s| s.iteration))
        .collect();
    assert_eq!(snapshot_iterations, vec![0, 2, 4]);
    assert_eq!(result.snapshots().len(), 3);
}

#[test]
fn loaded_weights_give_the_same_result() {
    let network = small_network();

    let mut file = Vec::new();
    network.write(&mut file).unwrap();
    let loaded = Network::read(&mut file.as_slice()).unwrap();

    let run = |network: Arc<dyn FeatureExtractor>| {
        session(network)
            .iterations(2)
            .build()
            .unwrap()
            .run(None, None)
            .unwrap()
            .into_image()
    };

    let original: Arc<dyn FeatureExtractor> = network;
    let loaded: Arc<dyn FeatureExtractor> = Arc::new(loaded);
    assert_eq!(run(original).to_rgb8(), run(loaded).to_rgb8());
}
