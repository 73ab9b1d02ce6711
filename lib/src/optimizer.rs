use tracing::{debug, info, trace, warn};

use crate::{
    loss::{LossBreakdown, LossEngine},
    preprocess::Normalization,
    session::{CancelToken, ProgressStat, ProgressUpdate, RunProgress},
    tensor::Tensor,
    Error,
};

/// The update rule applied to the generated image each iteration
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OptimizerKind {
    /// `x -= lr * g`
    GradientDescent,
    /// Adam, with the bias correction folded into the learning rate and
    /// `epsilon` added to the uncorrected `sqrt(v)`, as TensorFlow does
    Adam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
}

impl OptimizerKind {
    /// Adam with the settings commonly used for style transfer, which favor
    /// very smooth, slowly turning updates
    pub fn adam() -> Self {
        Self::Adam {
            beta1: 0.99,
            beta2: 0.999,
            epsilon: 1e-1,
        }
    }
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::adam()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct OptimizerSettings {
    pub(crate) kind: OptimizerKind,
    pub(crate) learning_rate: f32,
    /// `lr_i = lr / (1 + decay * i)`
    pub(crate) learning_rate_decay: f32,
}

/// Holds the per-pixel state of the update rule
struct Stepper {
    settings: OptimizerSettings,
    first_moment: Vec<f32>,
    second_moment: Vec<f32>,
    steps: i32,
}

impl Stepper {
    fn new(settings: OptimizerSettings, len: usize) -> Self {
        let moments = match settings.kind {
            OptimizerKind::Adam { .. } => len,
            OptimizerKind::GradientDescent => 0,
        };

        Self {
            settings,
            first_moment: vec![0.0; moments],
            second_moment: vec![0.0; moments],
            steps: 0,
        }
    }

    fn learning_rate(&self, iteration: u32) -> f32 {
        self.settings.learning_rate / (1.0 + self.settings.learning_rate_decay * iteration as f32)
    }

    fn step(&mut self, iteration: u32, params: &mut Tensor, grad: &Tensor) {
        let lr = self.learning_rate(iteration);
        self.steps += 1;

        match self.settings.kind {
            OptimizerKind::GradientDescent => params.add_scaled(grad, -lr),
            OptimizerKind::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                let correction1 = 1.0 - beta1.powi(self.steps);
                let correction2 = 1.0 - beta2.powi(self.steps);
                let lr_t = lr * correction2.sqrt() / correction1;

                for (((x, g), m), v) in params
                    .as_mut_slice()
                    .iter_mut()
                    .zip(grad.as_slice())
                    .zip(self.first_moment.iter_mut())
                    .zip(self.second_moment.iter_mut())
                {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *x -= lr_t * *m / (v.sqrt() + epsilon);
                }
            }
        }
    }
}

/// The state of an optimization loop
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// The generated image has been seeded, nothing was evaluated yet
    Initialized,
    Running,
    /// Every iteration was executed
    Completed,
    /// An iteration failed, see `RunFailure`
    Failed,
    /// The loop was stopped early by a `CancelToken`
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a run stopped early
#[derive(Debug)]
pub enum RunFailure {
    /// The loss or its gradient stopped being finite at this iteration
    NonFinite { iteration: u32 },
    /// The feature extractor failed
    Extractor(Error),
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFinite { iteration } => {
                write!(f, "the loss became non-finite at iteration {}", iteration)
            }
            Self::Extractor(err) => write!(f, "feature extraction failed: {}", err),
        }
    }
}

/// The image and loss of the generated image at one iteration
#[derive(Clone)]
pub struct Snapshot {
    /// The number of updates applied to the seed image
    pub iteration: u32,
    pub loss: LossBreakdown,
    pub image: image::RgbImage,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct LoopConfig {
    pub(crate) iterations: u32,
    pub(crate) snapshot_interval: Option<u32>,
    pub(crate) optimizer: OptimizerSettings,
}

/// The lowest loss state seen so far
struct Best {
    iteration: u32,
    loss: LossBreakdown,
    tensor: Tensor,
}

/// What an optimization loop produced once it stopped
pub(crate) struct Outcome {
    pub(crate) state: LoopState,
    pub(crate) failure: Option<RunFailure>,
    /// The best tensor, or the seed if nothing could be evaluated
    pub(crate) image: image::RgbImage,
    pub(crate) loss: Option<LossBreakdown>,
    pub(crate) best_iteration: Option<u32>,
    pub(crate) iterations_run: u32,
    pub(crate) snapshots: Vec<Snapshot>,
}

/// Iteratively updates a generated image to minimize the loss of a
/// `LossEngine`.
///
/// Iteration `i` is the generated image after `i` updates. A loop with `n`
/// iterations evaluates the loss of iterations `0..=n` and applies `n`
/// updates, so the seed image is always a candidate for the best result.
pub(crate) struct Optimization<'a> {
    engine: LossEngine<'a>,
    normalization: Normalization,
    config: LoopConfig,
    stepper: Stepper,
    state: LoopState,
    seed: Tensor,
    generated: Tensor,
    iteration: u32,
    last_loss: Option<LossBreakdown>,
    best: Option<Best>,
    snapshots: Vec<Snapshot>,
    failure: Option<RunFailure>,
}

impl<'a> Optimization<'a> {
    pub(crate) fn new(
        engine: LossEngine<'a>,
        normalization: Normalization,
        seed: Tensor,
        config: LoopConfig,
    ) -> Self {
        let stepper = Stepper::new(config.optimizer, seed.shape().len());

        Self {
            engine,
            normalization,
            config,
            stepper,
            state: LoopState::Initialized,
            generated: seed.clone(),
            seed,
            iteration: 0,
            last_loss: None,
            best: None,
            snapshots: Vec::new(),
            failure: None,
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        self.state
    }

    pub(crate) fn best_loss(&self) -> Option<LossBreakdown> {
        self.best.as_ref().map(|b| b.loss)
    }

    fn fail(&mut self, failure: RunFailure) -> LoopState {
        warn!(iteration = self.iteration, "optimization failed: {}", failure);
        self.failure = Some(failure);
        self.state = LoopState::Failed;
        self.state
    }

    /// Stops the loop before the next evaluation
    pub(crate) fn cancel(&mut self) {
        if !self.state.is_terminal() {
            info!(iteration = self.iteration, "optimization cancelled");
            self.state = LoopState::Cancelled;
        }
    }

    /// Evaluates the current iteration and, unless it is the last one,
    /// applies an update. Does nothing once the loop has stopped.
    pub(crate) fn step(&mut self) -> LoopState {
        match self.state {
            LoopState::Initialized => {
                info!(iterations = self.config.iterations, "optimization started");
                self.state = LoopState::Running;
            }
            LoopState::Running => {}
            terminal => return terminal,
        }

        let iteration = self.iteration;
        let is_last = iteration >= self.config.iterations;

        let evaluated = if is_last {
            self.engine.loss(&self.generated).map(|loss| (loss, None))
        } else {
            self.engine
                .evaluate(&self.generated)
                .map(|eval| (eval.loss, Some(eval.gradient)))
        };

        let (loss, gradient) = match evaluated {
            Ok(evaluated) => evaluated,
            Err(err) => return self.fail(RunFailure::Extractor(err)),
        };

        let gradient_finite = gradient.as_ref().map_or(true, Tensor::is_finite);
        if !loss.is_finite() || !gradient_finite {
            return self.fail(RunFailure::NonFinite { iteration });
        }

        trace!(
            iteration,
            total = loss.total,
            content = loss.content,
            style = loss.style,
            "evaluated"
        );

        self.last_loss = Some(loss);
        self.record(iteration, loss, is_last);

        match gradient {
            Some(gradient) => {
                self.stepper.step(iteration, &mut self.generated, &gradient);
                self.normalization.clip(&mut self.generated);
                self.iteration += 1;
            }
            None => {
                info!(
                    iterations = iteration,
                    best = ?self.best_loss().map(|l| l.total),
                    "optimization completed"
                );
                self.state = LoopState::Completed;
            }
        }

        self.state
    }

    fn record(&mut self, iteration: u32, loss: LossBreakdown, is_last: bool) {
        let improved = self.best.as_ref().map_or(true, |b| loss.total < b.loss.total);
        if improved {
            self.best = Some(Best {
                iteration,
                loss,
                tensor: self.generated.clone(),
            });
        }

        let on_interval = match self.config.snapshot_interval {
            Some(interval) => iteration % interval.max(1) == 0 || is_last,
            None => false,
        };

        if on_interval {
            debug!(iteration, total = loss.total, "snapshot");
            self.snapshots.push(Snapshot {
                iteration,
                loss,
                image: self.normalization.to_image(&self.generated),
            });
        }
    }

    /// Steps until the loop stops, checking `cancel` before every step and
    /// reporting each evaluated iteration to `progress`
    pub(crate) fn run(
        mut self,
        mut progress: Option<Box<dyn RunProgress>>,
        cancel: Option<&CancelToken>,
    ) -> Outcome {
        let total = self.config.iterations as usize + 1;

        while !self.state().is_terminal() {
            if cancel.map_or(false, CancelToken::is_cancelled) {
                self.cancel();
                break;
            }

            let snapshots_before = self.snapshots.len();
            let iteration = self.iteration;

            if self.step() == LoopState::Failed {
                break;
            }

            if let Some(progress) = progress.as_mut() {
                let snapshot = if self.snapshots.len() > snapshots_before {
                    self.snapshots.last()
                } else {
                    None
                };

                if let (Some(loss), Some(best)) = (self.last_loss, self.best.as_ref()) {
                    progress.update(ProgressUpdate {
                        iteration: ProgressStat {
                            current: iteration as usize + 1,
                            total,
                        },
                        loss,
                        best_loss: best.loss,
                        best_iteration: best.iteration,
                        snapshot,
                    });
                }
            }
        }

        self.into_outcome()
    }

    fn into_outcome(self) -> Outcome {
        let (image, loss, best_iteration) = match self.best {
            Some(best) => (
                self.normalization.to_image(&best.tensor),
                Some(best.loss),
                Some(best.iteration),
            ),
            None => (self.normalization.to_image(&self.seed), None, None),
        };

        Outcome {
            state: self.state,
            failure: self.failure,
            image,
            loss,
            best_iteration,
            iterations_run: self.iteration,
            snapshots: self.snapshots,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        extractor::{FeatureExtractor, FeatureMaps, LayerSet},
        loss::{LossWeights, Targets},
        network::Network,
        tensor::Shape,
    };

    fn settings(kind: OptimizerKind, learning_rate: f32) -> OptimizerSettings {
        OptimizerSettings {
            kind,
            learning_rate,
            learning_rate_decay: 0.0,
        }
    }

    #[test]
    fn gradient_descent_step() {
        let mut stepper = Stepper::new(settings(OptimizerKind::GradientDescent, 0.5), 2);
        let mut x = Tensor::from_vec(Shape::new(1, 1, 2), vec![1.0, 2.0]).unwrap();
        let g = Tensor::from_vec(Shape::new(1, 1, 2), vec![2.0, -2.0]).unwrap();

        stepper.step(0, &mut x, &g);
        assert_eq!(x.as_slice(), &[0.0, 3.0]);
    }

    #[test]
    fn first_adam_step_applies_epsilon_before_correction() {
        // m = (1 - b1) g, v = (1 - b2) g², and the step is
        // lr * sqrt(1 - b2) / (1 - b1) * m / (sqrt(v) + eps)
        let mut stepper = Stepper::new(settings(OptimizerKind::adam(), 5.0), 1);
        let mut x = Tensor::from_vec(Shape::new(1, 1, 1), vec![0.0]).unwrap();
        let g = Tensor::from_vec(Shape::new(1, 1, 1), vec![100.0]).unwrap();

        stepper.step(0, &mut x, &g);
        let lr_t = 5.0 * 0.001f32.sqrt() / 0.01;
        let expected = -lr_t * 1.0 / (10.0f32.sqrt() + 0.1);
        assert!((x.as_slice()[0] - expected).abs() < 1e-3);
        // about 4.85, noticeably smaller than lr
        assert!(x.as_slice()[0] > -4.9 && x.as_slice()[0] < -4.8);
    }

    #[test]
    fn learning_rate_decays() {
        let stepper = Stepper::new(
            OptimizerSettings {
                kind: OptimizerKind::GradientDescent,
                learning_rate: 1.0,
                learning_rate_decay: 0.5,
            },
            0,
        );

        assert_eq!(stepper.learning_rate(0), 1.0);
        assert_eq!(stepper.learning_rate(2), 0.5);
    }

    /// An extractor that produces a NaN activation after a number of calls
    struct Poisoned {
        inner: Network,
        healthy_calls: std::sync::atomic::AtomicUsize,
    }

    impl FeatureExtractor for Poisoned {
        fn layer_names(&self) -> Vec<&str> {
            self.inner.layer_names()
        }

        fn input_channels(&self) -> usize {
            3
        }

        fn extract(&self, input: &Tensor, layers: &LayerSet) -> Result<FeatureMaps, Error> {
            let mut maps = self.inner.extract(input, layers)?;
            let remaining = self.healthy_calls.load(std::sync::atomic::Ordering::SeqCst);
            if remaining == 0 {
                for name in layers.iter() {
                    if let Some(t) = maps.get_mut(name) {
                        t.as_mut_slice()[0] = f32::NAN;
                    }
                }
            } else {
                self.healthy_calls
                    .store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            }
            Ok(maps)
        }

        fn backward(&self, input: &Tensor, grads: &FeatureMaps) -> Result<Tensor, Error> {
            self.inner.backward(input, grads)
        }
    }

    fn seed_tensor(offset: usize) -> Tensor {
        let shape = Shape::new(3, 6, 6);
        Tensor::from_vec(
            shape,
            (0..shape.len())
                .map(|i| (((i + offset) * 13) % 29) as f32 * 4.0 - 50.0)
                .collect(),
        )
        .unwrap()
    }

    fn config(iterations: u32) -> LoopConfig {
        LoopConfig {
            iterations,
            snapshot_interval: Some(1),
            optimizer: settings(OptimizerKind::adam(), 5.0),
        }
    }

    #[test]
    fn non_finite_loss_fails_and_keeps_last_good_state() {
        let extractor = Poisoned {
            inner: Network::builder(3).seed(1).conv("c", 4, 3).build().unwrap(),
            // two calls for the targets, then three good iterations
            healthy_calls: std::sync::atomic::AtomicUsize::new(5),
        };
        let layers = LayerSet::new(vec!["c"]);
        let targets =
            Targets::compute(&extractor, &seed_tensor(0), &seed_tensor(7), &layers, &layers)
                .unwrap();
        let engine = LossEngine::new(&extractor, &targets, LossWeights::default());

        let outcome =
            Optimization::new(engine, Normalization::default(), seed_tensor(0), config(10))
                .run(None, None);

        assert_eq!(outcome.state, LoopState::Failed);
        assert!(matches!(
            outcome.failure,
            Some(RunFailure::NonFinite { iteration: 3 })
        ));
        assert!(outcome.best_iteration.unwrap() <= 2);
        assert_eq!(outcome.snapshots.len(), 3);
        assert_eq!(outcome.iterations_run, 3);
    }

    #[test]
    fn steps_after_completion_do_nothing() {
        let net = Network::builder(3).seed(1).conv("c", 4, 3).build().unwrap();
        let layers = LayerSet::new(vec!["c"]);
        let targets =
            Targets::compute(&net, &seed_tensor(0), &seed_tensor(7), &layers, &layers).unwrap();
        let engine = LossEngine::new(&net, &targets, LossWeights::default());

        let mut opt =
            Optimization::new(engine, Normalization::default(), seed_tensor(0), config(1));
        assert_eq!(opt.state(), LoopState::Initialized);
        assert_eq!(opt.step(), LoopState::Running);
        assert_eq!(opt.step(), LoopState::Completed);
        assert_eq!(opt.step(), LoopState::Completed);
        assert_eq!(opt.iteration, 1);
    }
}
