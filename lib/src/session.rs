use crate::*;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{info, warn};

/// Style transfer session.
///
/// Calling `run()` optimizes a new image and returns it, consuming the
/// session in the process. You can provide a `RunProgress` implementation to
/// get an update after every iteration, including periodic snapshots of the
/// image being optimized, and a `CancelToken` to stop the run early.
///
/// # Example
/// ```no_run
/// let session = neural_style::Session::builder()
///     .content(&"imgs/house.jpg")
///     .style(&"imgs/starry-night.jpg")
///     .iterations(250)
///     .build().expect("failed to build session");
///
/// let result = session.run(None, None).expect("failed to compute targets");
/// result.save("stylized.jpg").expect("failed to save image");
/// ```
pub struct Session {
    content: Tensor,
    style: Tensor,
    content_layers: LayerSet,
    style_layers: LayerSet,
    extractor: Arc<dyn FeatureExtractor>,
    normalization: Normalization,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The size of the image that will be generated
    pub fn output_size(&self) -> Dims {
        let shape = self.content.shape();
        Dims::new(shape.width as u32, shape.height as u32)
    }

    /// Computes the content and style targets, then runs the optimizer.
    ///
    /// An error is only returned if the targets can't be computed. Anything
    /// going wrong once the optimization started is reported through
    /// `RunResult::status`, alongside the best image found until then.
    pub fn run(
        self,
        progress: Option<Box<dyn RunProgress>>,
        cancel: Option<&CancelToken>,
    ) -> Result<RunResult, Error> {
        let size = self.output_size();
        info!(
            width = size.width,
            height = size.height,
            iterations = self.params.iterations,
            content_layers = self.content_layers.len(),
            style_layers = self.style_layers.len(),
            "starting style transfer"
        );

        let extractor = &*self.extractor;
        let targets = Targets::compute(
            extractor,
            &self.content,
            &self.style,
            &self.content_layers,
            &self.style_layers,
        )?;

        let engine = LossEngine::new(extractor, &targets, self.params.weights);
        let optimization = Optimization::new(
            engine,
            self.normalization,
            self.content,
            self.params.to_loop_config(),
        );

        let outcome = optimization.run(progress, cancel);

        let status = match (outcome.state, outcome.failure) {
            (_, Some(failure)) => RunStatus::Failed(failure),
            (LoopState::Cancelled, None) => RunStatus::Cancelled,
            (_, None) => RunStatus::Completed,
        };

        Ok(RunResult {
            image: outcome.image,
            loss: outcome.loss,
            best_iteration: outcome.best_iteration,
            iterations_run: outcome.iterations_run,
            snapshots: outcome.snapshots,
            status,
        })
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will check all of the provided inputs to verify that the style
/// transfer can run
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    content_layers: Option<LayerSet>,
    style_layers: Option<LayerSet>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image whose structure the generated image keeps. The
    /// generated image starts out as a copy of it, and has its size.
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// Sets the image whose texture and colors are transferred.
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// The layers whose activations the generated image must match with the
    /// content image.
    ///
    /// Default: `block5_conv2`
    pub fn content_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.content_layers = Some(LayerSet::new(layers));
        self
    }

    /// The layers whose Gram matrices the generated image must match with
    /// the style image.
    ///
    /// Default: `block1_conv1`, `block2_conv1`, `block3_conv1`,
    /// `block4_conv1`, `block5_conv1`
    pub fn style_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.style_layers = Some(LayerSet::new(layers));
        self
    }

    /// How strongly the content loss is weighted.
    ///
    /// Default: 1000.0
    pub fn content_weight(mut self, weight: f32) -> Self {
        self.params.weights.content = weight;
        self
    }

    /// How strongly the style loss is weighted. Gram matrices are much larger
    /// in magnitude than activations, so this is typically several orders of
    /// magnitude smaller than the content weight.
    ///
    /// Default: 0.01
    pub fn style_weight(mut self, weight: f32) -> Self {
        self.params.weights.style = weight;
        self
    }

    /// The number of updates applied to the generated image. With 0, the
    /// content image is returned as is.
    ///
    /// Default: 100
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// Default: 5.0
    pub fn learning_rate(mut self, lr: f32) -> Self {
        self.params.learning_rate = lr;
        self
    }

    /// Decays the learning rate as `lr / (1 + decay * iteration)`.
    ///
    /// Default: 0.0
    pub fn learning_rate_decay(mut self, decay: f32) -> Self {
        self.params.learning_rate_decay = decay;
        self
    }

    /// Default: `OptimizerKind::adam()`
    pub fn optimizer(mut self, kind: OptimizerKind) -> Self {
        self.params.optimizer = kind;
        self
    }

    /// Records a snapshot of the generated image every `interval` iterations,
    /// as well as of the last one.
    ///
    /// Default: no snapshots
    pub fn snapshot_interval(mut self, interval: u32) -> Self {
        self.params.snapshots = Some(Snapshots::Interval(interval));
        self
    }

    /// Records about `count` evenly spaced snapshots over the run, plus one
    /// of the last iteration.
    pub fn snapshot_count(mut self, count: u32) -> Self {
        self.params.snapshots = Some(Snapshots::Count(count));
        self
    }

    /// Input images whose longest side exceeds this are downscaled to it,
    /// keeping their aspect ratio.
    ///
    /// Default: 512
    pub fn max_dimension(mut self, size: u32) -> Self {
        self.params.max_dimension = Some(size);
        self
    }

    /// Uses the input images at their original size.
    pub fn keep_input_size(mut self) -> Self {
        self.params.max_dimension = None;
        self
    }

    /// Sets the frozen network used to extract features. The same extractor
    /// can be shared by any number of sessions.
    ///
    /// Default: `Network::vgg16(0)`
    pub fn extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// The maximum number of worker threads the default network uses. A
    /// custom extractor set with `extractor` manages its own threads.
    ///
    /// Default: the number of logical cores
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or
    /// input images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.params.check_validity()?;

        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None => {
                let network = Network::vgg16(0);
                let network = match self.params.max_thread_count {
                    Some(count) => network.with_max_thread_count(count),
                    None => network,
                };
                Arc::new(network)
            }
        };

        let content_layers = self
            .content_layers
            .unwrap_or_else(|| LayerSet::new(DEFAULT_CONTENT_LAYERS.iter().copied()));
        let style_layers = self
            .style_layers
            .unwrap_or_else(|| LayerSet::new(DEFAULT_STYLE_LAYERS.iter().copied()));

        check_layers(&*extractor, &content_layers, "content")?;
        check_layers(&*extractor, &style_layers, "style")?;

        let content = self.content.ok_or(Error::MissingImage("content"))?;
        let style = self.style.ok_or(Error::MissingImage("style"))?;

        if extractor.input_channels() != 3 {
            return Err(Error::shape(
                "feature extractor input",
                "3 channels",
                format!("{} channels", extractor.input_channels()),
            ));
        }

        let content = load_image(content, self.params.max_dimension)?;
        let style = load_image(style, self.params.max_dimension)?;

        let mut all_layers = content_layers.clone();
        for name in style_layers.iter() {
            all_layers.insert(name);
        }
        let min_size = extractor.min_input_size(&all_layers);
        check_size(&content, min_size, "content image")?;
        check_size(&style, min_size, "style image")?;

        let normalization = Normalization::default();

        Ok(Session {
            content: normalization.to_tensor(&content),
            style: normalization.to_tensor(&style),
            content_layers,
            style_layers,
            extractor,
            normalization,
            params: self.params,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Snapshots {
    Interval(u32),
    Count(u32),
}

struct Parameters {
    weights: LossWeights,
    iterations: u32,
    learning_rate: f32,
    learning_rate_decay: f32,
    optimizer: OptimizerKind,
    snapshots: Option<Snapshots>,
    max_dimension: Option<u32>,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            weights: LossWeights::default(),
            iterations: 100,
            learning_rate: 5.0,
            learning_rate_decay: 0.0,
            optimizer: OptimizerKind::default(),
            snapshots: None,
            max_dimension: Some(512),
            max_thread_count: None,
        }
    }
}

fn invalid_range(min: f32, max: f32, value: f32, name: &'static str) -> Error {
    Error::InvalidRange(errors::InvalidRange {
        min,
        max,
        value,
        name,
    })
}

/// `value` must be finite and strictly positive
fn check_positive(value: f32, name: &'static str) -> Result<(), Error> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(invalid_range(0.0, f32::MAX, value, name))
    }
}

impl Parameters {
    fn check_validity(&self) -> Result<(), Error> {
        check_positive(self.weights.content, "content-weight")?;
        check_positive(self.weights.style, "style-weight")?;
        check_positive(self.learning_rate, "learning-rate")?;

        if !(self.learning_rate_decay >= 0.0 && self.learning_rate_decay.is_finite()) {
            return Err(invalid_range(
                0.0,
                f32::MAX,
                self.learning_rate_decay,
                "learning-rate-decay",
            ));
        }

        if let OptimizerKind::Adam {
            beta1,
            beta2,
            epsilon,
        } = self.optimizer
        {
            for (value, name) in &[(beta1, "adam-beta1"), (beta2, "adam-beta2")] {
                if !(*value >= 0.0 && *value < 1.0) {
                    return Err(invalid_range(0.0, 1.0, *value, *name));
                }
            }
            check_positive(epsilon, "adam-epsilon")?;
        }

        match self.snapshots {
            Some(Snapshots::Interval(0)) => {
                return Err(invalid_range(1.0, u32::MAX as f32, 0.0, "snapshot-interval"));
            }
            Some(Snapshots::Count(0)) => {
                return Err(invalid_range(1.0, u32::MAX as f32, 0.0, "snapshot-count"));
            }
            _ => {}
        }

        if self.max_dimension == Some(0) {
            return Err(invalid_range(1.0, u32::MAX as f32, 0.0, "max-dimension"));
        }

        if self.max_thread_count == Some(0) {
            return Err(invalid_range(1.0, 1024.0, 0.0, "max-thread-count"));
        }

        Ok(())
    }

    fn to_loop_config(&self) -> LoopConfig {
        let snapshot_interval = self.snapshots.map(|snapshots| match snapshots {
            Snapshots::Interval(interval) => interval,
            Snapshots::Count(count) => (self.iterations / count).max(1),
        });

        LoopConfig {
            iterations: self.iterations,
            snapshot_interval,
            optimizer: OptimizerSettings {
                kind: self.optimizer,
                learning_rate: self.learning_rate,
                learning_rate_decay: self.learning_rate_decay,
            },
        }
    }
}

fn check_layers(
    extractor: &dyn FeatureExtractor,
    layers: &LayerSet,
    which: &'static str,
) -> Result<(), Error> {
    if layers.is_empty() {
        return Err(Error::EmptyLayerSet(which));
    }

    if let Some(unknown) = layers.first_unknown(extractor) {
        return Err(Error::UnknownLayer(unknown.to_owned()));
    }

    Ok(())
}

fn check_size(img: &image::RgbImage, min_size: usize, what: &'static str) -> Result<(), Error> {
    if (img.width() as usize) < min_size || (img.height() as usize) < min_size {
        return Err(Error::shape(
            what,
            format!("at least {}x{}", min_size, min_size),
            format!("{}x{}", img.width(), img.height()),
        ));
    }

    Ok(())
}

/// The layers content is matched on unless specified otherwise
pub const DEFAULT_CONTENT_LAYERS: &[&str] = &["block5_conv2"];

/// The layers style is matched on unless specified otherwise
pub const DEFAULT_STYLE_LAYERS: &[&str] = &[
    "block1_conv1",
    "block2_conv1",
    "block3_conv1",
    "block4_conv1",
    "block5_conv1",
];

/// Why a run ended
#[derive(Debug)]
pub enum RunStatus {
    /// Every iteration was executed
    Completed,
    /// The run was stopped through its `CancelToken`
    Cancelled,
    /// An iteration failed, the result holds the best image found before it
    Failed(RunFailure),
}

/// The output of `Session::run()`
pub struct RunResult {
    image: image::RgbImage,
    loss: Option<LossBreakdown>,
    best_iteration: Option<u32>,
    iterations_run: u32,
    snapshots: Vec<Snapshot>,
    status: RunStatus,
}

impl RunResult {
    /// The lowest loss image that was found, or the content image if no
    /// iteration could be evaluated
    pub fn image(&self) -> &image::RgbImage {
        &self.image
    }

    /// The loss of `image()`
    pub fn loss(&self) -> Option<LossBreakdown> {
        self.loss
    }

    /// The iteration `image()` was taken from
    pub fn best_iteration(&self) -> Option<u32> {
        self.best_iteration
    }

    /// The number of updates that were applied before the run ended
    pub fn iterations_run(&self) -> u32 {
        self.iterations_run
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    /// Saves the image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        self.image.save(&path)?;
        Ok(())
    }

    /// Saves every snapshot to `dir`, named after its iteration
    pub fn save_snapshots<P: AsRef<Path>>(&self, dir: P) -> Result<(), Error> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(&dir)?;

        for snapshot in &self.snapshots {
            snapshot
                .image
                .save(&dir.join(format!("{:05}.png", snapshot.iteration)))?;
        }

        Ok(())
    }

    /// Writes the image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image();
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.image)
    }
}

impl AsRef<image::RgbImage> for RunResult {
    fn as_ref(&self) -> &image::RgbImage {
        &self.image
    }
}

/// A flag shared between a running session and whoever may want to stop
/// it. The session checks it before every iteration.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Helper struct for passing progress information to external callers
#[derive(Copy, Clone, Debug)]
pub struct ProgressStat {
    /// The current amount of work that has been done
    pub current: usize,
    /// The total amount of work to do
    pub total: usize,
}

/// The state of the optimizer after an iteration was evaluated
pub struct ProgressUpdate<'a> {
    /// The number of iterations evaluated so far, out of `iterations + 1`
    pub iteration: ProgressStat,
    /// The loss of the iteration that was just evaluated
    pub loss: LossBreakdown,
    /// The lowest loss seen so far
    pub best_loss: LossBreakdown,
    pub best_iteration: u32,
    /// Set if a snapshot was recorded for this iteration
    pub snapshot: Option<&'a Snapshot>,
}

/// Allows the optimizer to update external callers with the current
/// progress of the run.
///
/// Updates are delivered on the optimizer's thread, so an implementation
/// that blocks stalls the run. Use `ChannelProgress` to hand updates to
/// another thread without blocking.
pub trait RunProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> RunProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}

/// An owned copy of a `ProgressUpdate`
#[derive(Clone)]
pub struct ProgressEvent {
    pub iteration: ProgressStat,
    pub loss: LossBreakdown,
    pub best_loss: LossBreakdown,
    pub best_iteration: u32,
    pub snapshot: Option<Snapshot>,
}

/// Forwards progress over a bounded channel. When the receiver falls behind
/// and the channel is full, updates are dropped rather than waited on.
pub struct ChannelProgress {
    sender: crossbeam_channel::Sender<ProgressEvent>,
    dropped: usize,
}

impl ChannelProgress {
    pub fn bounded(capacity: usize) -> (Self, crossbeam_channel::Receiver<ProgressEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender, dropped: 0 }, receiver)
    }

    /// The number of updates that were dropped so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl RunProgress for ChannelProgress {
    fn update(&mut self, info: ProgressUpdate<'_>) {
        let event = ProgressEvent {
            iteration: info.iteration,
            loss: info.loss,
            best_loss: info.best_loss,
            best_iteration: info.best_iteration,
            snapshot: info.snapshot.cloned(),
        };

        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                if self.dropped == 0 {
                    warn!("progress receiver is falling behind, dropping updates");
                }
                self.dropped += 1;
            }
            // Nobody is listening anymore, which is fine
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {}
        }
    }
}
